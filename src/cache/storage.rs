//! In-memory TTL cache store.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::traits::Cacheable;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::FetchError;

/// Expiry used when `now + ttl` does not fit in an `Instant`.
const MAX_TTL: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Type-erased cached value. Callers get their concrete type back through
/// [`CacheStore::get_as`].
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// A single cached value with its expiry.
#[derive(Clone)]
pub struct CacheEntry {
  value: CachedValue,
  stored_at: Instant,
  expires_at: Instant,
  /// Wall-clock time of the write, for display only
  cached_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn is_fresh(&self, now: Instant) -> bool {
    now < self.expires_at
  }

  pub fn stored_at(&self) -> Instant {
    self.stored_at
  }

  pub fn expires_at(&self) -> Instant {
    self.expires_at
  }
}

impl std::fmt::Debug for CacheEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheEntry")
      .field("stored_at", &self.stored_at)
      .field("expires_at", &self.expires_at)
      .field("cached_at", &self.cached_at)
      .finish_non_exhaustive()
  }
}

/// Result of a cache lookup. Present entries are returned even when expired;
/// `fresh` tells them apart.
#[derive(Debug, Clone)]
pub struct Lookup<T> {
  pub value: T,
  pub fresh: bool,
  pub cached_at: DateTime<Utc>,
}

/// Thread-safe key/value store with monotonic expiry.
///
/// Knows nothing about the network or retries. Expired entries stay readable
/// (as stale) until the next sweep past their retention window.
pub struct CacheStore {
  entries: RwLock<HashMap<String, CacheEntry>>,
  clock: Arc<dyn Clock>,
  stale_retention: Duration,
}

impl CacheStore {
  pub fn new(clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      clock,
      stale_retention: config.stale_retention,
    }
  }

  /// Look up a key. Returns `None` only when the key is missing.
  pub fn get(&self, key: &str) -> Option<Lookup<CachedValue>> {
    let now = self.clock.now();
    let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

    entries.get(key).map(|entry| Lookup {
      value: Arc::clone(&entry.value),
      fresh: entry.is_fresh(now),
      cached_at: entry.cached_at,
    })
  }

  /// Typed lookup. A present value of another type is a `TypeMismatch`.
  pub fn get_as<T: Cacheable>(&self, key: &str) -> Result<Option<Lookup<T>>, FetchError> {
    let Some(lookup) = self.get(key) else {
      return Ok(None);
    };

    match (*lookup.value).downcast_ref::<T>() {
      Some(value) => Ok(Some(Lookup {
        value: value.clone(),
        fresh: lookup.fresh,
        cached_at: lookup.cached_at,
      })),
      None => Err(FetchError::TypeMismatch {
        key: key.to_string(),
      }),
    }
  }

  /// Store a value for `ttl`, replacing any previous entry.
  ///
  /// A zero TTL would produce an entry that is never fresh, so it is ignored.
  pub fn set(&self, key: &str, value: CachedValue, ttl: Duration) -> bool {
    if ttl.is_zero() {
      debug!(key, "ignoring cache write with zero ttl");
      return false;
    }

    let now = self.clock.now();
    let entry = CacheEntry {
      value,
      stored_at: now,
      expires_at: expiry(now, ttl),
      cached_at: Utc::now(),
    };

    self
      .entries
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key.to_string(), entry);
    true
  }

  /// Typed convenience over [`CacheStore::set`].
  pub fn insert<T: Cacheable>(&self, key: &str, value: T, ttl: Duration) -> bool {
    self.set(key, Arc::new(value), ttl)
  }

  /// Remove a single entry. Returns whether it existed.
  pub fn invalidate(&self, key: &str) -> bool {
    self
      .entries
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(key)
      .is_some()
  }

  /// Remove everything. Returns the number of entries dropped.
  pub fn clear(&self) -> usize {
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
    let count = entries.len();
    entries.clear();
    count
  }

  /// Remove entries whose expiry (plus stale retention) has passed.
  pub fn sweep(&self) -> usize {
    let now = self.clock.now();
    let retention = self.stale_retention;
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

    let before = entries.len();
    entries.retain(|_, entry| {
      entry
        .expires_at
        .checked_add(retention)
        .map_or(true, |until| until > now)
    });
    before - entries.len()
  }

  pub fn contains(&self, key: &str) -> bool {
    self
      .entries
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Run [`CacheStore::sweep`] every `every`, independent of access patterns.
  ///
  /// The task stops on its own once the store is dropped.
  pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
    let store: Weak<Self> = Arc::downgrade(self);
    let every = every.max(Duration::from_millis(1));

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
          break;
        };

        let removed = store.sweep();
        if removed > 0 {
          debug!(removed, remaining = store.len(), "swept expired cache entries");
        }
      }
    })
  }
}

/// `now + ttl`, clamped so very long TTLs mean "effectively never".
fn expiry(now: Instant, ttl: Duration) -> Instant {
  now
    .checked_add(ttl)
    .or_else(|| now.checked_add(MAX_TTL))
    .unwrap_or(now)
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::future::BoxFuture;
  use proptest::prelude::*;
  use std::sync::Mutex;

  /// Clock that only moves when told to.
  struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
  }

  impl ManualClock {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        base: Instant::now(),
        offset: Mutex::new(Duration::ZERO),
      })
    }

    fn set(&self, offset: Duration) {
      *self.offset.lock().unwrap() = offset;
    }
  }

  impl Clock for ManualClock {
    fn now(&self) -> Instant {
      self.base + *self.offset.lock().unwrap()
    }

    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
      Box::pin(async {})
    }
  }

  fn store_with(clock: Arc<ManualClock>, retention: Duration) -> CacheStore {
    CacheStore::new(
      clock,
      &CacheConfig {
        stale_retention: retention,
        ..CacheConfig::default()
      },
    )
  }

  #[test]
  fn test_unbounded_ttl_never_expires() {
    let clock = ManualClock::new();
    let store = store_with(clock.clone(), Duration::MAX);

    assert!(store.insert("k", 1u64, Duration::MAX));

    clock.set(Duration::from_secs(86_400 * 365));
    assert!(store.get_as::<u64>("k").unwrap().unwrap().fresh);
    assert_eq!(store.sweep(), 0);
    assert!(store.contains("k"));
  }

  #[test]
  fn test_fresh_then_stale() {
    let clock = ManualClock::new();
    let store = store_with(clock.clone(), Duration::ZERO);

    store.insert("k", "A".to_string(), Duration::from_millis(5000));

    clock.set(Duration::from_millis(4000));
    let hit = store.get_as::<String>("k").unwrap().unwrap();
    assert_eq!(hit.value, "A");
    assert!(hit.fresh);

    // Expired but not yet swept: still readable as stale
    clock.set(Duration::from_millis(6000));
    let hit = store.get_as::<String>("k").unwrap().unwrap();
    assert_eq!(hit.value, "A");
    assert!(!hit.fresh);

    // After the sweep it is gone
    assert_eq!(store.sweep(), 1);
    assert!(store.get("k").is_none());
  }

  #[test]
  fn test_sweep_respects_stale_retention() {
    let clock = ManualClock::new();
    let store = store_with(clock.clone(), Duration::from_secs(60));

    store.insert("k", 1u32, Duration::from_secs(1));
    clock.set(Duration::from_secs(30));
    assert_eq!(store.sweep(), 0);
    assert!(!store.get("k").unwrap().fresh);

    clock.set(Duration::from_secs(61));
    assert_eq!(store.sweep(), 1);
    assert!(store.is_empty());
  }

  #[test]
  fn test_type_mismatch() {
    let store = store_with(ManualClock::new(), Duration::ZERO);
    store.insert("k", 42u64, Duration::from_secs(1));

    let err = store.get_as::<String>("k").unwrap_err();
    assert!(matches!(err, FetchError::TypeMismatch { .. }));
  }

  #[test]
  fn test_invalidate_and_clear() {
    let store = store_with(ManualClock::new(), Duration::ZERO);
    store.insert("a", 1u8, Duration::from_secs(1));
    store.insert("b", 2u8, Duration::from_secs(1));

    assert!(store.invalidate("a"));
    assert!(!store.invalidate("a"));
    assert_eq!(store.len(), 1);
    assert_eq!(store.clear(), 1);
    assert!(store.is_empty());
  }

  #[test]
  fn test_zero_ttl_is_not_stored() {
    let store = store_with(ManualClock::new(), Duration::ZERO);
    assert!(!store.insert("k", 1u8, Duration::ZERO));
    assert!(!store.contains("k"));
  }

  #[test]
  fn test_overwrite_replaces_value() {
    let store = store_with(ManualClock::new(), Duration::ZERO);
    store.insert("k", "old".to_string(), Duration::from_secs(1));
    store.insert("k", "new".to_string(), Duration::from_secs(1));
    assert_eq!(store.get_as::<String>("k").unwrap().unwrap().value, "new");
  }

  #[tokio::test(start_paused = true)]
  async fn test_sweeper_runs_on_interval() {
    let store = Arc::new(CacheStore::new(
      Arc::new(crate::clock::TokioClock),
      &CacheConfig::default(),
    ));
    store.insert("k", 1u8, Duration::from_secs(1));
    let handle = store.spawn_sweeper(Duration::from_secs(60));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(store.contains("k"));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!store.contains("k"));
    handle.abort();
  }

  proptest! {
    #[test]
    fn prop_fresh_exactly_within_ttl(ttl_ms in 1u64..100_000, probe_ms in 0u64..200_000) {
      let clock = ManualClock::new();
      let store = store_with(clock.clone(), Duration::ZERO);
      store.insert("k", 7u32, Duration::from_millis(ttl_ms));

      clock.set(Duration::from_millis(probe_ms));
      let hit = store.get_as::<u32>("k").unwrap().unwrap();
      prop_assert_eq!(hit.value, 7);
      prop_assert_eq!(hit.fresh, probe_ms < ttl_ms);
    }
  }
}
