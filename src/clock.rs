//! Injectable time source.
//!
//! Everything that compares timestamps or sleeps between retries goes through a
//! [`Clock`], so tests can swap in a recording clock or run on tokio's paused time.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic clock plus sleep.
pub trait Clock: Send + Sync + 'static {
  /// Current monotonic instant.
  fn now(&self) -> Instant;

  /// Suspend for `duration`.
  fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by `tokio::time`. Honors `tokio::time::pause()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
  fn now(&self) -> Instant {
    Instant::now()
  }

  fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
    Box::pin(tokio::time::sleep(duration))
  }
}
