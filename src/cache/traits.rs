//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Values the layer can cache and hand out to several callers.
///
/// Blanket-implemented: any `Clone + Send + Sync + 'static` type qualifies.
pub trait Cacheable: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Cacheable for T {}

/// Logical key of a request.
///
/// Structured keys implement `canonical`; the default `cache_hash` turns it
/// into a stable, fixed-length SHA-256 hex key. Plain strings are used verbatim.
pub trait QueryKey {
  /// Canonical text form of the key.
  fn canonical(&self) -> String;

  /// Key used for the cache and the in-flight map.
  fn cache_hash(&self) -> String {
    digest(&self.canonical())
  }

  /// Human-readable description, used in logs.
  fn description(&self) -> String {
    self.canonical()
  }
}

impl QueryKey for str {
  fn canonical(&self) -> String {
    self.to_string()
  }

  fn cache_hash(&self) -> String {
    self.to_string()
  }
}

impl QueryKey for String {
  fn canonical(&self) -> String {
    self.clone()
  }

  fn cache_hash(&self) -> String {
    self.clone()
  }
}

/// SHA-256 hex digest of `input`.
pub fn digest(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Result from a fetch, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// True when the caller should show a degraded-data indicator.
  pub fn is_degraded(&self) -> bool {
    matches!(self.source, CacheSource::CacheStale | CacheSource::Offline)
  }

  pub fn into_data(self) -> T {
    self.data
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, expired, served because the network was slow or failing
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  struct ProfileKey {
    user_id: u64,
  }

  impl QueryKey for ProfileKey {
    fn canonical(&self) -> String {
      format!("profile:{}", self.user_id)
    }
  }

  #[test]
  fn test_structured_keys_are_hashed() {
    let key = ProfileKey { user_id: 7 };
    let hash = key.cache_hash();
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, ProfileKey { user_id: 7 }.cache_hash());
    assert_ne!(hash, ProfileKey { user_id: 8 }.cache_hash());
    assert_eq!(key.description(), "profile:7");
  }

  #[test]
  fn test_string_keys_are_verbatim() {
    assert_eq!("users:42".cache_hash(), "users:42");
    assert_eq!(String::from("users:42").cache_hash(), "users:42");
  }

  #[test]
  fn test_degraded_sources() {
    let now = Utc::now();
    assert!(!CacheResult::from_network(1).is_degraded());
    assert!(!CacheResult::from_cache(1, now, false).is_degraded());
    assert!(CacheResult::from_cache(1, now, true).is_degraded());
    assert!(CacheResult::offline(1, now).is_degraded());
  }
}
