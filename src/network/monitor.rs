//! Connectivity and connection-quality tracking.

use chrono::Utc;
use color_eyre::eyre::eyre;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::probe::Probe;
use super::signal::{NetworkSignal, SignalEvent, SubscriptionToken};
use super::state::{ConnectionQuality, Connectivity, NetworkState};
use crate::clock::Clock;
use crate::config::NetworkConfig;

type RecoverCallback = Arc<dyn Fn() + Send + Sync>;

/// Identifies a registered recovery callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecoverHandle(u64);

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
  Reachable {
    latency: Duration,
    quality: ConnectionQuality,
  },
  Unreachable {
    consecutive_failures: u32,
  },
}

/// Tracks [`NetworkState`] from platform signals and periodic probes.
///
/// Platform signals are authoritative for Online/Offline. Probes only refine
/// the quality tier and move between Online and Unstable, since the platform
/// can report "online" while the backend is unreachable.
pub struct NetworkMonitor {
  state: watch::Sender<NetworkState>,
  probe: Option<Arc<dyn Probe>>,
  clock: Arc<dyn Clock>,
  config: NetworkConfig,
  consecutive_failures: AtomicU32,
  callbacks: Mutex<Vec<(u64, RecoverCallback)>>,
  next_callback: AtomicU64,
  signal_token: Mutex<Option<SubscriptionToken>>,
}

impl NetworkMonitor {
  /// Create a monitor that starts Online with no probe.
  pub fn new(config: NetworkConfig, clock: Arc<dyn Clock>) -> Self {
    let (state, _) = watch::channel(NetworkState::online());

    Self {
      state,
      probe: None,
      clock,
      config,
      consecutive_failures: AtomicU32::new(0),
      callbacks: Mutex::new(Vec::new()),
      next_callback: AtomicU64::new(0),
      signal_token: Mutex::new(None),
    }
  }

  /// Set the probe used for latency classification.
  pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
    self.probe = Some(probe);
    self
  }

  /// Take the initial connectivity from `signal` and follow its events.
  pub fn attach_signal(self: &Arc<Self>, signal: &dyn NetworkSignal) {
    let initial = if signal.is_connected() {
      Connectivity::Online
    } else {
      Connectivity::Offline
    };

    // Startup state, not a transition: no recovery callbacks
    self.state.send_if_modified(|state| {
      let changed = state.connectivity != initial;
      state.connectivity = initial;
      changed
    });

    let monitor: Weak<Self> = Arc::downgrade(self);
    let token = signal.subscribe(Arc::new(move |event| {
      if let Some(monitor) = monitor.upgrade() {
        monitor.handle_signal(event);
      }
    }));

    *self
      .signal_token
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(token);
  }

  /// Current network snapshot.
  pub fn status(&self) -> NetworkState {
    self.state.borrow().clone()
  }

  /// Receiver that observes every state change.
  pub fn watch(&self) -> watch::Receiver<NetworkState> {
    self.state.subscribe()
  }

  /// Register a callback fired once per transition back to Online.
  pub fn on_recover(&self, callback: impl Fn() + Send + Sync + 'static) -> RecoverHandle {
    let id = self.next_callback.fetch_add(1, Ordering::Relaxed);
    self
      .callbacks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push((id, Arc::new(callback)));
    RecoverHandle(id)
  }

  pub fn remove_recover(&self, handle: RecoverHandle) -> bool {
    let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
    let before = callbacks.len();
    callbacks.retain(|(id, _)| *id != handle.0);
    callbacks.len() != before
  }

  /// Apply a platform connectivity event.
  ///
  /// Reconnecting resets the quality tier to Excellent. Readings from before
  /// the outage no longer apply; the next probe refines it.
  pub fn handle_signal(&self, event: SignalEvent) {
    match event {
      SignalEvent::Disconnected => {
        self.transition(Connectivity::Offline, "platform disconnected");
      }
      SignalEvent::Connected => {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
          if state.connectivity == Connectivity::Online {
            return false;
          }
          state.quality = ConnectionQuality::Excellent;
          true
        });
        self.transition(Connectivity::Online, "platform connected");
      }
    }
  }

  /// Run the probe once and fold the outcome into the state.
  ///
  /// Returns `None` when there is no probe or the platform reports Offline.
  pub async fn probe_once(&self) -> Option<ProbeOutcome> {
    let probe = self.probe.as_ref()?;

    if self.status().connectivity == Connectivity::Offline {
      debug!("skipping network probe while offline");
      return None;
    }

    let started = self.clock.now();
    let result = tokio::select! {
      result = probe.check() => result,
      _ = self.clock.sleep(self.config.probe_timeout) => {
        Err(eyre!("probe timed out after {:?}", self.config.probe_timeout))
      }
    };
    let latency = self.clock.now().saturating_duration_since(started);

    match result {
      Ok(()) => {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let quality = ConnectionQuality::from_latency(latency);
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);

        self.state.send_modify(|state| {
          state.quality = quality;
          state.last_probe_latency_ms = Some(latency_ms);
          state.last_probe_at = Some(Utc::now());
        });
        debug!(latency_ms, ?quality, "network probe succeeded");

        if self.status().connectivity == Connectivity::Unstable {
          self.transition(Connectivity::Online, "probe succeeded");
        }

        Some(ProbeOutcome::Reachable { latency, quality })
      }
      Err(err) => {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(failures, error = %err, "network probe failed");

        self.state.send_modify(|state| {
          state.quality = ConnectionQuality::Critical;
          state.last_probe_at = Some(Utc::now());
        });

        if failures >= self.config.unstable_after_failures
          && self.status().connectivity == Connectivity::Online
        {
          self.transition(Connectivity::Unstable, "consecutive probe failures");
        }

        Some(ProbeOutcome::Unreachable {
          consecutive_failures: failures,
        })
      }
    }
  }

  /// Probe on a fixed interval. Returns `None` when no probe is configured.
  pub fn spawn_prober(self: &Arc<Self>) -> Option<JoinHandle<()>> {
    self.probe.as_ref()?;

    let monitor: Weak<Self> = Arc::downgrade(self);
    let every = self.config.probe_interval.max(Duration::from_millis(1));

    Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        let Some(monitor) = monitor.upgrade() else {
          break;
        };
        monitor.probe_once().await;
      }
    }))
  }

  /// Move to `to`. Re-entering the current state is a no-op.
  fn transition(&self, to: Connectivity, reason: &str) {
    let mut from = to;
    let changed = self.state.send_if_modified(|state| {
      if state.connectivity == to {
        return false;
      }
      from = state.connectivity;
      state.connectivity = to;
      true
    });

    if !changed {
      return;
    }

    info!(?from, ?to, reason, "connectivity changed");

    if to == Connectivity::Online {
      self.fire_recovered();
    }
  }

  fn fire_recovered(&self) {
    // Snapshot so callbacks may register or remove callbacks themselves
    let callbacks: Vec<RecoverCallback> = self
      .callbacks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .map(|(_, callback)| Arc::clone(callback))
      .collect();

    for callback in callbacks {
      callback();
    }
  }
}
