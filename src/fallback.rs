//! Compose several lookup strategies into one operation.
//!
//! The layer treats operations as opaque. When a record can be found through
//! more than one query (e.g. by auth id, then by user id, then by primary key),
//! a [`FallbackChain`] turns those queries into a single operation that can be
//! passed to `fetch`.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::AttemptError;

type Strategy<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, AttemptError>> + Send + Sync>;

/// Ordered list of named lookup strategies.
///
/// A permanent failure (typically "not found under this lookup") moves on to
/// the next strategy. A transient failure stops the chain, so the retry
/// executor retries the whole lookup.
pub struct FallbackChain<T> {
  strategies: Vec<(String, Strategy<T>)>,
}

impl<T: Send + 'static> FallbackChain<T> {
  pub fn new() -> Self {
    Self {
      strategies: Vec::new(),
    }
  }

  /// Append a strategy.
  pub fn then<F, Fut>(mut self, name: impl Into<String>, lookup: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, AttemptError>> + Send + 'static,
  {
    self
      .strategies
      .push((name.into(), Box::new(move || lookup().boxed())));
    self
  }

  pub fn len(&self) -> usize {
    self.strategies.len()
  }

  pub fn is_empty(&self) -> bool {
    self.strategies.is_empty()
  }

  /// Try each strategy in order.
  pub async fn run(&self) -> Result<T, AttemptError> {
    let mut last = None;

    for (name, lookup) in &self.strategies {
      match lookup().await {
        Ok(value) => {
          debug!(strategy = %name, "lookup strategy matched");
          return Ok(value);
        }
        Err(AttemptError::Permanent(err)) => {
          debug!(strategy = %name, error = %err, "lookup strategy found nothing, trying next");
          last = Some(AttemptError::Permanent(err));
        }
        Err(err) => return Err(err),
      }
    }

    Err(last.unwrap_or_else(|| AttemptError::permanent_msg("no lookup strategies configured")))
  }

  /// Turn the chain into a repeatable operation for `ResilienceLayer::fetch`.
  pub fn into_operation(
    self,
  ) -> impl Fn() -> BoxFuture<'static, Result<T, AttemptError>> + Send + Sync + 'static {
    let chain = Arc::new(self);
    move || {
      let chain = Arc::clone(&chain);
      async move { chain.run().await }.boxed()
    }
  }
}

impl<T: Send + 'static> Default for FallbackChain<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Debug, Clone, PartialEq)]
  struct Profile {
    id: u64,
  }

  #[tokio::test]
  async fn test_falls_through_not_found() {
    let chain = FallbackChain::<Profile>::new()
      .then("auth_user_id", || async {
        Err(AttemptError::permanent_msg("no row for auth_user_id"))
      })
      .then("user_id", || async {
        Err(AttemptError::permanent_msg("no row for user_id"))
      })
      .then("id", || async { Ok(Profile { id: 9 }) });

    assert_eq!(chain.run().await.unwrap(), Profile { id: 9 });
  }

  #[tokio::test]
  async fn test_transient_failure_stops_chain() {
    let later = Arc::new(AtomicU32::new(0));
    let l = later.clone();

    let chain = FallbackChain::new()
      .then("auth_user_id", || async {
        Err::<Profile, _>(AttemptError::transient_msg("connection reset"))
      })
      .then("id", move || {
        l.fetch_add(1, Ordering::SeqCst);
        async { Ok(Profile { id: 1 }) }
      });

    let err = chain.run().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(later.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_all_missing_reports_last_permanent() {
    let chain = FallbackChain::<Profile>::new()
      .then("user_id", || async { Err(AttemptError::permanent_msg("no row for user_id")) });

    let err = chain.into_operation()().await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("user_id"));
  }

  #[tokio::test]
  async fn test_empty_chain_is_permanent_failure() {
    let chain = FallbackChain::<Profile>::default();
    assert!(chain.is_empty());
    assert!(!chain.run().await.unwrap_err().is_retryable());
  }
}
