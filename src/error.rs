//! Error taxonomy for operations and for the layer itself.
//!
//! Operations report [`AttemptError`], which tells the retry executor whether a
//! failure is worth retrying. The layer reports [`FetchError`], which is `Clone`
//! so a single failed execution can be handed to every coalesced waiter.

use color_eyre::eyre::{eyre, Report};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a single failed attempt of a caller-supplied operation.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
  /// The attempt did not settle before the per-attempt timeout
  #[error("attempt timed out after {0:?}")]
  Timeout(Duration),
  /// Retry-eligible failure (connection error, 5xx, ...)
  #[error("transient failure: {0}")]
  Transient(Report),
  /// Failure that must never be retried (not found, validation, auth denied)
  #[error("permanent failure: {0}")]
  Permanent(Report),
}

impl AttemptError {
  /// Mark a failure as retry-eligible.
  pub fn transient(err: impl Into<Report>) -> Self {
    Self::Transient(err.into())
  }

  /// Mark a failure as "do not retry".
  pub fn permanent(err: impl Into<Report>) -> Self {
    Self::Permanent(err.into())
  }

  /// Convenience for `AttemptError::permanent(eyre!(msg))`.
  pub fn permanent_msg(msg: impl std::fmt::Display) -> Self {
    Self::Permanent(eyre!("{}", msg))
  }

  /// Convenience for `AttemptError::transient(eyre!(msg))`.
  pub fn transient_msg(msg: impl std::fmt::Display) -> Self {
    Self::Transient(eyre!("{}", msg))
  }

  pub fn is_retryable(&self) -> bool {
    !matches!(self, Self::Permanent(_))
  }
}

/// `?` on an eyre result inside an operation means "retry me".
impl From<Report> for AttemptError {
  fn from(err: Report) -> Self {
    Self::Transient(err)
  }
}

/// Timeouts, connect errors, 5xx, 408 and 429 are transient; any other
/// client error is permanent.
impl From<reqwest::Error> for AttemptError {
  fn from(err: reqwest::Error) -> Self {
    let permanent = match err.status() {
      Some(status) if status.is_client_error() => {
        status != reqwest::StatusCode::REQUEST_TIMEOUT
          && status != reqwest::StatusCode::TOO_MANY_REQUESTS
      }
      Some(_) => false,
      // Body decoding and builder errors won't get better on retry
      None => err.is_decode() || err.is_builder(),
    };

    if permanent {
      Self::Permanent(Report::new(err))
    } else {
      Self::Transient(Report::new(err))
    }
  }
}

/// Failure reported by the resilience layer to its callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  /// The operation signalled a permanent failure; no retries were spent on it
  #[error("permanent failure: {0}")]
  Permanent(Arc<Report>),
  /// Every attempt failed; carries the last underlying failure
  #[error("retries exhausted after {attempts} attempt(s): {last}")]
  RetryExhausted {
    attempts: u32,
    #[source]
    last: Arc<AttemptError>,
  },
  /// No cached fallback and the network is down: the operation was queued for replay
  #[error("request for {key} is queued until connectivity returns")]
  Pending { key: String },
  /// A cached or shared value exists for the key but holds a different type
  #[error("value for {key} does not have the requested type")]
  TypeMismatch { key: String },
  /// The shared execution task ended without producing a result (panic or abort)
  #[error("execution for {key} aborted: {reason}")]
  Aborted { key: String, reason: String },
}

impl FetchError {
  pub(crate) fn exhausted(attempts: u32, last: AttemptError) -> Self {
    Self::RetryExhausted {
      attempts,
      last: Arc::new(last),
    }
  }

  pub fn is_pending(&self) -> bool {
    matches!(self, Self::Pending { .. })
  }

  pub fn is_permanent(&self) -> bool {
    matches!(self, Self::Permanent(_))
  }

  pub fn is_exhausted(&self) -> bool {
    matches!(self, Self::RetryExhausted { .. })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_report_converts_to_transient() {
    let err: AttemptError = eyre!("connection reset").into();
    assert!(err.is_retryable());
    assert!(matches!(err, AttemptError::Transient(_)));
  }

  #[test]
  fn test_permanent_is_not_retryable() {
    assert!(!AttemptError::permanent_msg("row not found").is_retryable());
    assert!(AttemptError::Timeout(Duration::from_secs(1)).is_retryable());
  }

  #[test]
  fn test_exhausted_display_includes_last_error() {
    let err = FetchError::exhausted(3, AttemptError::transient_msg("502 bad gateway"));
    let msg = err.to_string();
    assert!(msg.contains("3 attempt(s)"));
    assert!(msg.contains("502 bad gateway"));
    assert!(err.is_exhausted());
  }
}
