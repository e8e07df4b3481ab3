//! Resilience layer that orchestrates caching, coalescing, retries and replay.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use crate::cache::{CacheResult, CacheStore, Cacheable, CachedValue, Lookup, QueryKey};
use crate::clock::{Clock, TokioClock};
use crate::coalesce::Coalescer;
use crate::config::{Config, FetchConfig, FetchOptions};
use crate::error::{AttemptError, FetchError};
use crate::network::{HttpProbe, NetworkMonitor, NetworkSignal, NetworkState, Probe, RecoverHandle};
use crate::retry::{DrainReport, ReplayOperation, RetryExecutor, RetryQueue, RetryQueueItem};

/// Cumulative fetch outcomes since the layer was built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchCounters {
  pub fresh_hits: u64,
  pub stale_served: u64,
  pub network_executions: u64,
  pub coalesced_joins: u64,
  pub pending: u64,
  pub failures: u64,
}

/// Point-in-time view of the layer.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
  pub cache_size: usize,
  pub in_flight_count: usize,
  pub queue_depth_by_key: BTreeMap<String, usize>,
  pub network: NetworkState,
  pub counters: FetchCounters,
}

#[derive(Default)]
struct Counters {
  fresh_hits: AtomicU64,
  stale_served: AtomicU64,
  network_executions: AtomicU64,
  pending: AtomicU64,
  failures: AtomicU64,
}

impl Counters {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }
}

/// Cheap-to-clone handle to the process-wide resilience layer.
///
/// Construct one with [`ResilienceLayer::builder`] and share it with every
/// caller. Background tasks (expiry sweep, network probe, queue drain) stop
/// when the last handle is dropped.
#[derive(Clone)]
pub struct ResilienceLayer {
  inner: Arc<Inner>,
}

struct Inner {
  config: Config,
  cache: Arc<CacheStore>,
  monitor: Arc<NetworkMonitor>,
  executor: RetryExecutor,
  coalescer: Arc<Coalescer>,
  queue: Arc<RetryQueue>,
  counters: Arc<Counters>,
  recover_handle: RecoverHandle,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
  fn drop(&mut self) {
    self.monitor.remove_recover(self.recover_handle);
    for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
      task.abort();
    }
  }
}

/// Builder for [`ResilienceLayer`].
pub struct ResilienceLayerBuilder {
  config: Config,
  clock: Arc<dyn Clock>,
  signal: Option<Arc<dyn NetworkSignal>>,
  probe: Option<Arc<dyn Probe>>,
}

impl ResilienceLayerBuilder {
  /// Replace the time source (tests).
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Follow platform connectivity events.
  pub fn signal(mut self, signal: Arc<dyn NetworkSignal>) -> Self {
    self.signal = Some(signal);
    self
  }

  /// Probe used for connection-quality classification.
  ///
  /// Takes precedence over `network.probe_url` in the configuration.
  pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
    self.probe = Some(probe);
    self
  }

  /// Build the layer and start its background tasks.
  ///
  /// Must be called from within a tokio runtime.
  pub fn build(self) -> Result<ResilienceLayer> {
    tokio::runtime::Handle::try_current()
      .map_err(|e| eyre!("ResilienceLayer must be built inside a tokio runtime: {}", e))?;

    let config = self.config;
    let probe = match (self.probe, &config.network.probe_url) {
      (Some(probe), _) => Some(probe),
      (None, Some(url)) => {
        Some(Arc::new(HttpProbe::new(url, config.network.probe_timeout)?) as Arc<dyn Probe>)
      }
      (None, None) => None,
    };

    let cache = Arc::new(CacheStore::new(Arc::clone(&self.clock), &config.cache));

    let mut monitor = NetworkMonitor::new(config.network.clone(), Arc::clone(&self.clock));
    if let Some(probe) = probe {
      monitor = monitor.with_probe(probe);
    }
    let monitor = Arc::new(monitor);
    if let Some(signal) = &self.signal {
      monitor.attach_signal(signal.as_ref());
    }

    let executor = RetryExecutor::new(Arc::clone(&self.clock));
    let queue = Arc::new(RetryQueue::new(config.queue.clone(), executor.clone()));

    // A recovery drains the queue right away instead of waiting for the timer
    let recovering = Arc::downgrade(&queue);
    let recover_handle = monitor.on_recover(move || {
      if let Some(queue) = recovering.upgrade() {
        queue.wake();
      }
    });

    let mut tasks = vec![
      cache.spawn_sweeper(config.cache.sweep_interval),
      queue.spawn_drainer(Arc::downgrade(&monitor)),
    ];
    tasks.extend(monitor.spawn_prober());

    Ok(ResilienceLayer {
      inner: Arc::new(Inner {
        config,
        cache,
        monitor,
        executor,
        coalescer: Arc::new(Coalescer::new()),
        queue,
        counters: Arc::new(Counters::default()),
        recover_handle,
        tasks: Mutex::new(tasks),
      }),
    })
  }
}

impl ResilienceLayer {
  pub fn builder(config: Config) -> ResilienceLayerBuilder {
    ResilienceLayerBuilder {
      config,
      clock: Arc::new(TokioClock),
      signal: None,
      probe: None,
    }
  }

  /// Fetch with the layer's default options.
  pub async fn fetch<K, T, F, Fut>(
    &self,
    key: &K,
    operation: F,
  ) -> Result<CacheResult<T>, FetchError>
  where
    K: QueryKey + ?Sized,
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, AttemptError>> + Send + 'static,
  {
    self.fetch_with(key, operation, FetchOptions::default()).await
  }

  /// Fetch `key`, running `operation` only when the cache can't answer.
  ///
  /// 1. Fresh cache hit: return it (unless `force_refresh`)
  /// 2. Stale entry and a degraded network: return the stale entry right away
  /// 3. Otherwise run the operation once per key (coalesced) with retries
  /// 4. On success, write the cache and return the fresh value
  /// 5. On exhaustion, fall back to a stale entry; with none and no network,
  ///    queue the operation for replay and report `Pending`
  pub async fn fetch_with<K, T, F, Fut>(
    &self,
    key: &K,
    operation: F,
    options: FetchOptions,
  ) -> Result<CacheResult<T>, FetchError>
  where
    K: QueryKey + ?Sized,
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, AttemptError>> + Send + 'static,
  {
    let span = info_span!("fetch", key = %key.description());
    self
      .fetch_resolved(key.cache_hash(), Arc::new(operation), options)
      .instrument(span)
      .await
  }

  async fn fetch_resolved<T, F, Fut>(
    &self,
    key: String,
    operation: Arc<F>,
    options: FetchOptions,
  ) -> Result<CacheResult<T>, FetchError>
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, AttemptError>> + Send + 'static,
  {
    let inner = &self.inner;
    let config = options.resolve(&inner.config.fetch);

    if config.cache_enabled && !options.force_refresh {
      if let Some(hit) = inner.cache.get_as::<T>(&key)? {
        if hit.fresh {
          Counters::bump(&inner.counters.fresh_hits);
          debug!("serving fresh cache entry");
          return Ok(CacheResult::from_cache(hit.value, hit.cached_at, false));
        }

        // Don't block on a network that is likely slow or failing
        let network = inner.monitor.status();
        if network.is_degraded() {
          Counters::bump(&inner.counters.stale_served);
          debug!(
            connectivity = ?network.connectivity,
            quality = ?network.quality,
            "network degraded, serving stale cache entry"
          );
          return Ok(stale_result(hit, &network));
        }
      }
    }

    let execution = self
      .execution::<T, F, Fut>(key.clone(), operation, config.clone())
      .in_current_span();

    match inner.coalescer.run(&key, execution).await {
      Ok(value) => downcast::<T>(&key, &value).map(CacheResult::from_network),
      Err(err @ FetchError::RetryExhausted { .. }) if config.cache_enabled => {
        match inner.cache.get_as::<T>(&key)? {
          Some(hit) => {
            Counters::bump(&inner.counters.stale_served);
            warn!(error = %err, "retries exhausted, serving stale cache entry");
            Ok(stale_result(hit, &inner.monitor.status()))
          }
          None => {
            Counters::bump(&inner.counters.failures);
            Err(err)
          }
        }
      }
      Err(FetchError::Pending { .. }) if options.wait_for_replay => {
        self.await_replay::<T>(&key).await
      }
      Err(err @ FetchError::Pending { .. }) => Err(err),
      Err(err) => {
        Counters::bump(&inner.counters.failures);
        Err(err)
      }
    }
  }

  /// The coalesced unit of work: retry the operation, then write the cache or
  /// queue the operation. Runs on its own task and outlives any single caller.
  fn execution<T, F, Fut>(
    &self,
    key: String,
    operation: Arc<F>,
    config: FetchConfig,
  ) -> impl Future<Output = Result<CachedValue, FetchError>> + Send + 'static
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, AttemptError>> + Send + 'static,
  {
    let cache = Arc::clone(&self.inner.cache);
    let monitor = Arc::clone(&self.inner.monitor);
    let queue = Arc::clone(&self.inner.queue);
    let counters = Arc::clone(&self.inner.counters);
    let executor = self.inner.executor.clone();

    async move {
      Counters::bump(&counters.network_executions);

      let attempt = || {
        let operation = Arc::clone(&operation);
        async move { operation().await.map(|value| Arc::new(value) as CachedValue) }
      };

      let result = executor.execute(&config, attempt).await;
      match result {
        Ok(value) => {
          if config.cache_enabled {
            cache.set(&key, Arc::clone(&value), config.cache_ttl);
          }
          Ok(value)
        }
        Err(FetchError::RetryExhausted { attempts, last }) => {
          // Callers fall back to the stale entry themselves
          if config.cache_enabled && cache.contains(&key) {
            return Err(FetchError::RetryExhausted { attempts, last });
          }
          if monitor.status().is_online() {
            return Err(FetchError::RetryExhausted { attempts, last });
          }

          let replay =
            replay_operation::<T, F, Fut>(key.clone(), operation, Arc::clone(&cache), &config);
          let depth = queue.enqueue(RetryQueueItem::new(
            key.clone(),
            replay,
            config.attempt_timeout,
            attempts,
          ));
          Counters::bump(&counters.pending);
          warn!(depth, error = %last, "network unavailable, queued for replay");

          Err(FetchError::Pending { key })
        }
        Err(err) => Err(err),
      }
    }
  }

  async fn await_replay<T: Cacheable>(&self, key: &str) -> Result<CacheResult<T>, FetchError> {
    let Some(waiter) = self.inner.queue.wait_for(key) else {
      // Replayed between queueing and here; the replay wrote the cache
      return match self.inner.cache.get_as::<T>(key)? {
        Some(hit) if hit.fresh => Ok(CacheResult::from_cache(hit.value, hit.cached_at, false)),
        _ => Err(FetchError::Pending {
          key: key.to_string(),
        }),
      };
    };

    debug!("waiting for queued replay");
    match waiter.await {
      Ok(Ok(value)) => downcast::<T>(key, &value).map(CacheResult::from_network),
      Ok(Err(err)) => {
        Counters::bump(&self.inner.counters.failures);
        Err(err)
      }
      Err(_) => Err(FetchError::Pending {
        key: key.to_string(),
      }),
    }
  }

  /// Drop the cached entry for `key`.
  pub fn invalidate<K: QueryKey + ?Sized>(&self, key: &K) -> bool {
    self.inner.cache.invalidate(&key.cache_hash())
  }

  /// Drop every cached entry.
  pub fn clear_all(&self) -> usize {
    self.inner.cache.clear()
  }

  /// Write a value without running an operation (e.g. from a realtime push).
  ///
  /// `ttl` defaults to the configured cache TTL.
  pub fn prime<K, T>(&self, key: &K, value: T, ttl: Option<Duration>) -> bool
  where
    K: QueryKey + ?Sized,
    T: Cacheable,
  {
    let ttl = ttl.unwrap_or(self.inner.config.fetch.cache_ttl);
    self.inner.cache.insert(&key.cache_hash(), value, ttl)
  }

  /// Read the cache without touching the network.
  pub fn peek<K, T>(&self, key: &K) -> Result<Option<CacheResult<T>>, FetchError>
  where
    K: QueryKey + ?Sized,
    T: Cacheable,
  {
    let hit = self.inner.cache.get_as::<T>(&key.cache_hash())?;
    Ok(hit.map(|hit| CacheResult::from_cache(hit.value, hit.cached_at, !hit.fresh)))
  }

  /// Replay queued operations now.
  pub async fn drain_queue(&self) -> DrainReport {
    self.inner.queue.drain_once().await
  }

  pub fn stats(&self) -> Stats {
    let inner = &self.inner;
    let counters = &inner.counters;

    Stats {
      cache_size: inner.cache.len(),
      in_flight_count: inner.coalescer.in_flight_count(),
      queue_depth_by_key: inner.queue.depth_by_key(),
      network: inner.monitor.status(),
      counters: FetchCounters {
        fresh_hits: counters.fresh_hits.load(Ordering::Relaxed),
        stale_served: counters.stale_served.load(Ordering::Relaxed),
        network_executions: counters.network_executions.load(Ordering::Relaxed),
        coalesced_joins: inner.coalescer.joined_total(),
        pending: counters.pending.load(Ordering::Relaxed),
        failures: counters.failures.load(Ordering::Relaxed),
      },
    }
  }

  pub fn network(&self) -> &Arc<NetworkMonitor> {
    &self.inner.monitor
  }

  pub fn config(&self) -> &Config {
    &self.inner.config
  }

  /// Stop background tasks early. Fetches keep working without them.
  pub fn shutdown(&self) {
    let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    for task in tasks.drain(..) {
      task.abort();
    }
  }
}

/// One replay attempt of `operation` that writes the cache on success.
fn replay_operation<T, F, Fut>(
  key: String,
  operation: Arc<F>,
  cache: Arc<CacheStore>,
  config: &FetchConfig,
) -> ReplayOperation
where
  T: Cacheable,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, AttemptError>> + Send + 'static,
{
  let cache_enabled = config.cache_enabled;
  let ttl = config.cache_ttl;

  Arc::new(move || -> BoxFuture<'static, Result<CachedValue, AttemptError>> {
    let operation = Arc::clone(&operation);
    let cache = Arc::clone(&cache);
    let key = key.clone();

    Box::pin(async move {
      let value: CachedValue = Arc::new(operation().await?);
      if cache_enabled {
        cache.set(&key, Arc::clone(&value), ttl);
      }
      Ok(value)
    })
  })
}

fn stale_result<T>(hit: Lookup<T>, network: &NetworkState) -> CacheResult<T> {
  if network.is_online() {
    CacheResult::from_cache(hit.value, hit.cached_at, true)
  } else {
    CacheResult::offline(hit.value, hit.cached_at)
  }
}

fn downcast<T: Cacheable>(key: &str, value: &CachedValue) -> Result<T, FetchError> {
  (**value)
    .downcast_ref::<T>()
    .cloned()
    .ok_or_else(|| FetchError::TypeMismatch {
      key: key.to_string(),
    })
}
