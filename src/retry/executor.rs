//! Bounded retries with exponential backoff, jitter and per-attempt timeouts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backoff::retry_delay;
use crate::clock::Clock;
use crate::config::FetchConfig;
use crate::error::{AttemptError, FetchError};

/// Runs one async operation robustly. Knows nothing about caching or coalescing.
#[derive(Clone)]
pub struct RetryExecutor {
  clock: Arc<dyn Clock>,
}

impl RetryExecutor {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self { clock }
  }

  /// Current time on the executor's clock.
  pub fn now(&self) -> tokio::time::Instant {
    self.clock.now()
  }

  /// Race one attempt against `timeout`.
  ///
  /// When the timeout wins the attempt future is dropped and its result ignored.
  pub async fn attempt<T, Fut>(&self, timeout: Duration, attempt: Fut) -> Result<T, AttemptError>
  where
    Fut: Future<Output = Result<T, AttemptError>>,
  {
    tokio::select! {
      biased;
      result = attempt => result,
      _ = self.clock.sleep(timeout) => Err(AttemptError::Timeout(timeout)),
    }
  }

  /// Run `operation` until it succeeds, fails permanently, or `max_retries`
  /// attempts have failed.
  pub async fn execute<T, F, Fut>(
    &self,
    config: &FetchConfig,
    mut operation: F,
  ) -> Result<T, FetchError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
  {
    let max_attempts = config.max_retries.max(1);
    let mut attempt = 0;

    loop {
      attempt += 1;

      match self.attempt(config.attempt_timeout, operation()).await {
        Ok(value) => {
          if attempt > 1 {
            debug!(attempt, "operation succeeded after retrying");
          }
          return Ok(value);
        }
        Err(AttemptError::Permanent(err)) => {
          // Permanent failures never consume retry budget
          warn!(attempt, error = %err, "operation failed permanently");
          return Err(FetchError::Permanent(Arc::new(err)));
        }
        Err(err) if attempt >= max_attempts => {
          warn!(attempts = attempt, error = %err, "retries exhausted");
          return Err(FetchError::exhausted(attempt, err));
        }
        Err(err) => {
          let delay = retry_delay(attempt, config);
          warn!(attempt, max_attempts, ?delay, error = %err, "attempt failed, backing off");
          self.clock.sleep(delay).await;
        }
      }
    }
  }
}
