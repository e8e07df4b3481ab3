//! In-memory caching for the resilience layer.
//!
//! This module provides a network-agnostic cache that:
//! - Stores type-erased values under string keys with a per-entry TTL
//! - Reports expired-but-present entries as stale instead of missing
//! - Sweeps expired entries on a fixed interval, independent of access
//! - Describes where a returned value came from (network, fresh cache, stale cache, offline)

mod storage;
mod traits;

pub use storage::{CacheEntry, CacheStore, CachedValue, Lookup};
pub use traits::{digest, CacheResult, CacheSource, Cacheable, QueryKey};
