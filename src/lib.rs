//! Resilient cached data access.
//!
//! [`ResilienceLayer`] sits between application code and a remote data
//! source. For each keyed fetch it:
//! - answers from an in-memory TTL cache while the entry is fresh
//! - collapses concurrent fetches of one key into a single execution
//! - retries transient failures with capped, jittered exponential backoff
//! - serves stale data when the network is degraded or retries run out
//! - queues operations made while offline and replays them on reconnect
//!
//! ```no_run
//! use holdfast::{AttemptError, Config, ResilienceLayer};
//!
//! # async fn run() -> color_eyre::Result<()> {
//! let layer = ResilienceLayer::builder(Config::load(None)?).build()?;
//!
//! let profile = layer
//!   .fetch("profile:42", || async {
//!     Ok::<_, AttemptError>("Ada".to_string())
//!   })
//!   .await?;
//! println!("{} ({:?})", profile.data, profile.source);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod fallback;
pub mod layer;
pub mod logging;
pub mod network;
pub mod retry;

pub use cache::{CacheResult, CacheSource, Cacheable, QueryKey};
pub use config::{Config, FetchOptions};
pub use error::{AttemptError, FetchError};
pub use fallback::FallbackChain;
pub use layer::{FetchCounters, ResilienceLayer, ResilienceLayerBuilder, Stats};
pub use network::{ConnectionQuality, Connectivity, NetworkMonitor, NetworkState};
