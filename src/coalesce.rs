//! Single-flight execution per key.
//!
//! Concurrent callers for the same key share one execution. The execution runs
//! on its own task, so a caller giving up does not cancel it for the others,
//! and its in-flight entry is removed as soon as it settles.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

use crate::cache::CachedValue;
use crate::error::FetchError;

type SharedExecution = Shared<BoxFuture<'static, Result<CachedValue, FetchError>>>;

struct InFlight {
  id: u64,
  execution: SharedExecution,
}

#[derive(Default)]
pub struct Coalescer {
  inflight: Mutex<HashMap<String, InFlight>>,
  next_id: AtomicU64,
  joined: AtomicU64,
}

impl Coalescer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `execution` for `key`, or await the execution already in flight for it.
  ///
  /// `execution` is dropped unused when another one is in flight.
  pub async fn run<Fut>(
    self: &Arc<Self>,
    key: &str,
    execution: Fut,
  ) -> Result<CachedValue, FetchError>
  where
    Fut: Future<Output = Result<CachedValue, FetchError>> + Send + 'static,
  {
    self.join_or_start(key, execution).await
  }

  pub fn is_in_flight(&self, key: &str) -> bool {
    self
      .inflight
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains_key(key)
  }

  /// Number of keys with an execution in flight.
  pub fn in_flight_count(&self) -> usize {
    self.inflight.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  /// Total callers that joined an existing execution instead of starting one.
  pub fn joined_total(&self) -> u64 {
    self.joined.load(Ordering::Relaxed)
  }

  fn join_or_start<Fut>(self: &Arc<Self>, key: &str, execution: Fut) -> SharedExecution
  where
    Fut: Future<Output = Result<CachedValue, FetchError>> + Send + 'static,
  {
    let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = inflight.get(key) {
      self.joined.fetch_add(1, Ordering::Relaxed);
      debug!(key, "joining in-flight execution");
      return existing.execution.clone();
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let guard = InFlightGuard {
      coalescer: Arc::downgrade(self),
      key: key.to_string(),
      id,
    };

    // The guard lives inside the task, so the entry goes away when the
    // execution settles (or panics), before any waiter sees the result.
    let handle = tokio::spawn(async move {
      let _guard = guard;
      execution.await
    });

    let task_key = key.to_string();
    let shared = async move {
      match handle.await {
        Ok(result) => result,
        Err(err) => Err(FetchError::Aborted {
          key: task_key,
          reason: err.to_string(),
        }),
      }
    }
    .boxed()
    .shared();

    // Registered while still holding the lock, so the guard cannot run first
    inflight.insert(
      key.to_string(),
      InFlight {
        id,
        execution: shared.clone(),
      },
    );
    shared
  }

  fn finish(&self, key: &str, id: u64) {
    let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
    if inflight.get(key).is_some_and(|entry| entry.id == id) {
      inflight.remove(key);
    }
  }
}

struct InFlightGuard {
  coalescer: Weak<Coalescer>,
  key: String,
  id: u64,
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    if let Some(coalescer) = self.coalescer.upgrade() {
      coalescer.finish(&self.key, self.id);
    }
  }
}
