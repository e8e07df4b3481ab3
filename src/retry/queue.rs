//! Deferred replay of operations that failed while the network was down.
//!
//! The queue is memory only: a restart loses everything in it.

use futures::future::{join_all, BoxFuture};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::executor::RetryExecutor;
use crate::cache::CachedValue;
use crate::config::QueueConfig;
use crate::error::{AttemptError, FetchError};
use crate::network::NetworkMonitor;

/// A single replayable attempt of a queued operation.
pub type ReplayOperation =
  Arc<dyn Fn() -> BoxFuture<'static, Result<CachedValue, AttemptError>> + Send + Sync>;

/// What a caller waiting on a replay receives.
pub type ReplayResult = Result<CachedValue, FetchError>;

/// An operation waiting for connectivity to return.
pub struct RetryQueueItem {
  pub key: String,
  /// Set from the queue's clock when the item is queued
  enqueued_at: Option<Instant>,
  /// Attempts made so far, including the ones before it was queued
  pub attempts_so_far: u32,
  operation: ReplayOperation,
  attempt_timeout: Duration,
  replays: u32,
  waiters: Vec<oneshot::Sender<ReplayResult>>,
}

impl RetryQueueItem {
  pub fn new(
    key: impl Into<String>,
    operation: ReplayOperation,
    attempt_timeout: Duration,
    attempts_so_far: u32,
  ) -> Self {
    Self {
      key: key.into(),
      enqueued_at: None,
      attempts_so_far,
      operation,
      attempt_timeout,
      replays: 0,
      waiters: Vec::new(),
    }
  }

  pub fn enqueued_at(&self) -> Option<Instant> {
    self.enqueued_at
  }

  /// Resolve everyone still waiting on this item. Closed receivers are ignored.
  fn settle(self, result: ReplayResult) {
    for waiter in self.waiters {
      let _ = waiter.send(result.clone());
    }
  }

  fn overflowed(self) {
    let attempts = self.attempts_so_far;
    self.settle(Err(FetchError::exhausted(
      attempts,
      AttemptError::transient_msg("dropped from retry queue on overflow"),
    )));
  }
}

impl std::fmt::Debug for RetryQueueItem {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RetryQueueItem")
      .field("key", &self.key)
      .field("enqueued_at", &self.enqueued_at)
      .field("attempts_so_far", &self.attempts_so_far)
      .field("replays", &self.replays)
      .field("waiters", &self.waiters.len())
      .finish_non_exhaustive()
  }
}

/// Counts from one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub replayed: usize,
  pub succeeded: usize,
  pub requeued: usize,
  pub dropped: usize,
}

impl DrainReport {
  fn merge(&mut self, other: DrainReport) {
    self.replayed += other.replayed;
    self.succeeded += other.succeeded;
    self.requeued += other.requeued;
    self.dropped += other.dropped;
  }
}

/// Per-key FIFO of deferred operations, capped per key.
pub struct RetryQueue {
  items: Mutex<HashMap<String, VecDeque<RetryQueueItem>>>,
  config: QueueConfig,
  executor: RetryExecutor,
  drain_lock: tokio::sync::Mutex<()>,
  wake: Arc<Notify>,
}

impl RetryQueue {
  pub fn new(config: QueueConfig, executor: RetryExecutor) -> Self {
    Self {
      items: Mutex::new(HashMap::new()),
      config,
      executor,
      drain_lock: tokio::sync::Mutex::new(()),
      wake: Arc::new(Notify::new()),
    }
  }

  /// Append an item to its key's queue, dropping the oldest on overflow.
  ///
  /// Returns the queue depth for the key afterwards.
  pub fn enqueue(&self, mut item: RetryQueueItem) -> usize {
    item.enqueued_at = Some(self.executor.now());
    let key = item.key.clone();
    let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
    let queue = items.entry(key.clone()).or_default();
    queue.push_back(item);

    let overflow = self.trim(&key, queue);
    let depth = queue.len();
    drop(items);

    for dropped in overflow {
      dropped.overflowed();
    }
    debug!(key = %key, depth, "operation queued for replay");
    depth
  }

  /// Wait for the newest queued item of `key` to settle.
  ///
  /// `None` when nothing is queued for the key.
  pub fn wait_for(&self, key: &str) -> Option<oneshot::Receiver<ReplayResult>> {
    let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
    let item = items.get_mut(key)?.back_mut()?;

    let (tx, rx) = oneshot::channel();
    item.waiters.push(tx);
    Some(rx)
  }

  pub fn depth(&self, key: &str) -> usize {
    self
      .items
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .map_or(0, VecDeque::len)
  }

  pub fn depth_by_key(&self) -> BTreeMap<String, usize> {
    self
      .items
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .filter(|(_, queue)| !queue.is_empty())
      .map(|(key, queue)| (key.clone(), queue.len()))
      .collect()
  }

  /// When the oldest item still queued for `key` was queued.
  pub fn oldest_enqueued_at(&self, key: &str) -> Option<Instant> {
    self
      .items
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)?
      .front()?
      .enqueued_at
  }

  pub fn len(&self) -> usize {
    self
      .items
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .map(VecDeque::len)
      .sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Ask the drain loop to run now.
  pub fn wake(&self) {
    self.wake.notify_one();
  }

  /// Replay every item queued at the start of the call exactly once.
  ///
  /// Successes are removed, transient failures go back to the front of their
  /// key's queue, and items out of replays or failing permanently are dropped.
  pub async fn drain_once(&self) -> DrainReport {
    let _draining = self.drain_lock.lock().await;

    let batch: Vec<VecDeque<RetryQueueItem>> = {
      let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
      items.drain().map(|(_, queue)| queue).collect()
    };

    if batch.is_empty() {
      return DrainReport::default();
    }

    // Keys replay concurrently, items within a key in FIFO order
    let results = join_all(batch.into_iter().map(|queue| self.replay_key(queue))).await;

    let mut report = DrainReport::default();
    for (key_report, requeue) in results {
      report.merge(key_report);
      self.requeue_front(requeue);
    }

    info!(
      replayed = report.replayed,
      succeeded = report.succeeded,
      requeued = report.requeued,
      dropped = report.dropped,
      "retry queue drained"
    );
    report
  }

  /// Drain on a fixed interval while Online, and immediately on [`RetryQueue::wake`].
  pub fn spawn_drainer(self: &Arc<Self>, monitor: Weak<NetworkMonitor>) -> JoinHandle<()> {
    let queue: Weak<Self> = Arc::downgrade(self);
    let wake = Arc::clone(&self.wake);
    let every = self.config.drain_interval.max(Duration::from_millis(1));

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        let woken = tokio::select! {
          _ = ticker.tick() => false,
          _ = wake.notified() => true,
        };

        let Some(queue) = queue.upgrade() else {
          break;
        };
        if queue.is_empty() {
          continue;
        }

        // Timer drains wait for the network; wake-ups come from a recovery
        let online = monitor.upgrade().map_or(true, |m| m.status().is_online());
        if !woken && !online {
          debug!(queued = queue.len(), "deferring retry queue drain until online");
          continue;
        }

        queue.drain_once().await;
      }
    })
  }

  async fn replay_key(
    &self,
    queue: VecDeque<RetryQueueItem>,
  ) -> (DrainReport, Vec<RetryQueueItem>) {
    let mut report = DrainReport::default();
    let mut requeue = Vec::new();

    for mut item in queue {
      report.replayed += 1;
      item.replays += 1;
      item.attempts_so_far += 1;

      let result = self
        .executor
        .attempt(item.attempt_timeout, (item.operation)())
        .await;

      match result {
        Ok(value) => {
          report.succeeded += 1;
          info!(key = %item.key, attempts = item.attempts_so_far, "queued operation replayed");
          item.settle(Ok(value));
        }
        Err(AttemptError::Permanent(err)) => {
          report.dropped += 1;
          warn!(key = %item.key, error = %err, "queued operation failed permanently");
          item.settle(Err(FetchError::Permanent(Arc::new(err))));
        }
        Err(err) if item.replays >= self.config.max_replays => {
          report.dropped += 1;
          warn!(key = %item.key, replays = item.replays, error = %err, "dropping queued operation");
          let attempts = item.attempts_so_far;
          item.settle(Err(FetchError::exhausted(attempts, err)));
        }
        Err(err) => {
          report.requeued += 1;
          debug!(
            key = %item.key,
            replays = item.replays,
            error = %err,
            "replay failed, requeueing"
          );
          requeue.push(item);
        }
      }
    }

    (report, requeue)
  }

  /// Put failed replays back ahead of anything enqueued during the drain.
  fn requeue_front(&self, requeue: Vec<RetryQueueItem>) {
    let Some(key) = requeue.first().map(|item| item.key.clone()) else {
      return;
    };

    let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
    let queue = items.entry(key.clone()).or_default();
    for item in requeue.into_iter().rev() {
      queue.push_front(item);
    }

    let overflow = self.trim(&key, queue);
    drop(items);

    for dropped in overflow {
      dropped.overflowed();
    }
  }

  fn trim(&self, key: &str, queue: &mut VecDeque<RetryQueueItem>) -> Vec<RetryQueueItem> {
    let cap = self.config.max_depth_per_key.max(1);
    let mut overflow = Vec::new();

    while queue.len() > cap {
      if let Some(oldest) = queue.pop_front() {
        warn!(key, cap, "retry queue full, dropping oldest item");
        overflow.push(oldest);
      }
    }
    overflow
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::{Clock, TokioClock};
  use std::sync::atomic::{AtomicU32, Ordering};

  fn queue(max_depth_per_key: usize, max_replays: u32) -> RetryQueue {
    RetryQueue::new(
      QueueConfig {
        max_depth_per_key,
        max_replays,
        ..QueueConfig::default()
      },
      RetryExecutor::new(Arc::new(TokioClock)),
    )
  }

  /// Operation that fails `failures` times, then returns the call count.
  fn flaky(calls: Arc<AtomicU32>, failures: u32) -> ReplayOperation {
    Arc::new(move || -> BoxFuture<'static, Result<CachedValue, AttemptError>> {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      Box::pin(async move {
        if n <= failures {
          Err(AttemptError::transient_msg("still offline"))
        } else {
          Ok(Arc::new(n) as CachedValue)
        }
      })
    })
  }

  fn item(key: &str, operation: ReplayOperation) -> RetryQueueItem {
    RetryQueueItem::new(key, operation, Duration::from_secs(5), 3)
  }

  /// Clock frozen at one instant.
  struct FrozenClock(Instant);

  impl Clock for FrozenClock {
    fn now(&self) -> Instant {
      self.0
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
      Box::pin(tokio::time::sleep(duration))
    }
  }

  #[tokio::test]
  async fn test_enqueue_time_comes_from_clock() {
    let frozen = Instant::now() + Duration::from_secs(3600);
    let queue = RetryQueue::new(
      QueueConfig::default(),
      RetryExecutor::new(Arc::new(FrozenClock(frozen))),
    );
    let calls = Arc::new(AtomicU32::new(0));

    let queued = item("k", flaky(calls, 0));
    assert_eq!(queued.enqueued_at(), None);
    queue.enqueue(queued);

    assert_eq!(queue.oldest_enqueued_at("k"), Some(frozen));
    assert_eq!(queue.oldest_enqueued_at("other"), None);
  }

  #[tokio::test]
  async fn test_successful_replay_removes_item() {
    let queue = queue(10, 3);
    let calls = Arc::new(AtomicU32::new(0));
    queue.enqueue(item("k", flaky(calls.clone(), 0)));
    let waiter = queue.wait_for("k").unwrap();

    let report = queue.drain_once().await;
    assert_eq!(report.succeeded, 1);
    assert!(queue.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let value = waiter.await.unwrap().unwrap();
    assert_eq!(value.downcast_ref::<u32>(), Some(&1));
  }

  #[tokio::test]
  async fn test_each_item_replayed_once_per_drain() {
    let queue = queue(10, 5);
    let calls = Arc::new(AtomicU32::new(0));
    queue.enqueue(item("k", flaky(calls.clone(), 10)));

    let report = queue.drain_once().await;
    assert_eq!(report.replayed, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.depth("k"), 1);
  }

  #[tokio::test]
  async fn test_dropped_after_max_replays() {
    let queue = queue(10, 2);
    let calls = Arc::new(AtomicU32::new(0));
    queue.enqueue(item("k", flaky(calls.clone(), 10)));
    let waiter = queue.wait_for("k").unwrap();

    queue.drain_once().await;
    let report = queue.drain_once().await;
    assert_eq!(report.dropped, 1);
    assert!(queue.is_empty());

    match waiter.await.unwrap().unwrap_err() {
      // 3 attempts before queueing plus 2 replays
      FetchError::RetryExhausted { attempts, .. } => assert_eq!(attempts, 5),
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_permanent_replay_failure_drops_item() {
    let queue = queue(10, 5);
    let operation: ReplayOperation = Arc::new(|| -> BoxFuture<'static, _> {
      Box::pin(async { Err(AttemptError::permanent_msg("forbidden")) })
    });
    queue.enqueue(item("k", operation));
    let waiter = queue.wait_for("k").unwrap();

    let report = queue.drain_once().await;
    assert_eq!(report.dropped, 1);
    assert!(waiter.await.unwrap().unwrap_err().is_permanent());
  }

  #[tokio::test]
  async fn test_overflow_drops_oldest() {
    let queue = queue(2, 3);
    let first = Arc::new(AtomicU32::new(0));
    let later = Arc::new(AtomicU32::new(0));

    queue.enqueue(item("k", flaky(first.clone(), 0)));
    let oldest_waiter = queue.wait_for("k").unwrap();
    queue.enqueue(item("k", flaky(later.clone(), 0)));
    assert_eq!(queue.enqueue(item("k", flaky(later.clone(), 0))), 2);

    // The caller still waiting on the dropped item hears about it
    assert!(oldest_waiter.await.unwrap().unwrap_err().is_exhausted());

    queue.drain_once().await;
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(later.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_overflow_without_waiter_is_silent() {
    let queue = queue(1, 3);
    let calls = Arc::new(AtomicU32::new(0));
    queue.enqueue(item("k", flaky(calls.clone(), 0)));
    queue.enqueue(item("k", flaky(calls.clone(), 0)));
    assert_eq!(queue.depth_by_key().get("k"), Some(&1));
  }

  #[tokio::test]
  async fn test_requeued_items_stay_ahead_of_new_ones() {
    let queue = queue(10, 5);
    let calls = Arc::new(AtomicU32::new(0));
    queue.enqueue(item("k", flaky(calls.clone(), 10)));

    queue.drain_once().await;
    queue.enqueue(RetryQueueItem::new("k", flaky(calls.clone(), 10), Duration::from_secs(5), 0));

    let items = queue.items.lock().unwrap();
    let attempts: Vec<u32> = items["k"].iter().map(|i| i.attempts_so_far).collect();
    assert_eq!(attempts, vec![4, 0]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_wake_triggers_drain() {
    let queue = Arc::new(queue(10, 3));
    let calls = Arc::new(AtomicU32::new(0));
    let handle = queue.spawn_drainer(Weak::new());

    queue.enqueue(item("k", flaky(calls.clone(), 0)));
    queue.wake();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(queue.is_empty());
    handle.abort();
  }
}
