//! Retrying operations now, and replaying them later.

mod backoff;
mod executor;
mod queue;

pub use backoff::{backoff_delay, jitter, retry_delay};
pub use executor::RetryExecutor;
pub use queue::{DrainReport, ReplayOperation, ReplayResult, RetryQueue, RetryQueueItem};
