use rand::Rng;
use std::time::Duration;

use crate::config::FetchConfig;

/// Exponential delay before retry `attempt` (1-based), capped at `max`.
///
/// `base * 2^(attempt-1)`. The exponent is unbounded; overflow saturates to `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
  let exponent = attempt.saturating_sub(1);
  2u32
    .checked_pow(exponent)
    .and_then(|factor| base.checked_mul(factor))
    .map_or(max, |delay| delay.min(max))
}

/// Uniform random delay in `[0, bound]`.
pub fn jitter(bound: Duration) -> Duration {
  let bound_ms = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
  if bound_ms == 0 {
    return Duration::ZERO;
  }
  Duration::from_millis(rand::thread_rng().gen_range(0..=bound_ms))
}

/// Backoff plus jitter for the wait after failed attempt `attempt`.
pub fn retry_delay(attempt: u32, config: &FetchConfig) -> Duration {
  backoff_delay(attempt, config.base_delay, config.max_delay) + jitter(config.jitter)
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn test_doubles_until_capped() {
    let base = Duration::from_millis(1000);
    let max = Duration::from_millis(5000);
    let delays: Vec<u128> = (1..=5)
      .map(|n| backoff_delay(n, base, max).as_millis())
      .collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
  }

  #[test]
  fn test_huge_attempt_saturates() {
    let max = Duration::from_secs(30);
    assert_eq!(backoff_delay(200, Duration::from_secs(1), max), max);
  }

  #[test]
  fn test_zero_jitter() {
    assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
  }

  proptest! {
    #[test]
    fn prop_jitter_within_bound(bound_ms in 0u64..10_000) {
      let bound = Duration::from_millis(bound_ms);
      prop_assert!(jitter(bound) <= bound);
    }

    #[test]
    fn prop_delays_non_decreasing(
      base_ms in 1u64..5_000,
      max_ms in 1u64..120_000,
      jitter_ms in 0u64..2_000,
      attempt in 2u32..64,
    ) {
      let config = FetchConfig {
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_millis(max_ms),
        jitter: Duration::from_millis(jitter_ms),
        ..FetchConfig::default()
      };

      let previous = retry_delay(attempt - 1, &config);
      let current = retry_delay(attempt, &config);
      prop_assert!(current + config.jitter >= previous);
      prop_assert!(current <= config.max_delay + config.jitter);
    }
  }
}
