//! Platform connectivity notifications.
//!
//! The core only sees the [`NetworkSignal`] capability. A host adapter
//! (OS reachability API, browser bridge, ...) implements it outside the crate;
//! [`ManualSignal`] is the adapter for hosts that push events themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Connectivity change reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
  Connected,
  Disconnected,
}

pub type SignalHandler = Arc<dyn Fn(SignalEvent) + Send + Sync>;

/// Source of platform connectivity events.
pub trait NetworkSignal: Send + Sync {
  /// Current platform view, used once at startup.
  fn is_connected(&self) -> bool;

  /// Register a handler. Dropping the token unsubscribes it.
  fn subscribe(&self, handler: SignalHandler) -> SubscriptionToken;
}

/// Keeps a subscription alive; unsubscribes on drop.
pub struct SubscriptionToken {
  cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionToken {
  pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
    Self {
      cancel: Some(Box::new(cancel)),
    }
  }

  /// Token that does nothing when dropped.
  pub fn noop() -> Self {
    Self { cancel: None }
  }

  pub fn unsubscribe(mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}

impl Drop for SubscriptionToken {
  fn drop(&mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}

impl std::fmt::Debug for SubscriptionToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SubscriptionToken")
      .field("active", &self.cancel.is_some())
      .finish()
  }
}

#[derive(Default)]
struct Handlers {
  next_id: AtomicU64,
  map: Mutex<HashMap<u64, SignalHandler>>,
}

/// Signal driven by explicit `set_connected` calls.
#[derive(Clone)]
pub struct ManualSignal {
  connected: Arc<AtomicBool>,
  handlers: Arc<Handlers>,
}

impl ManualSignal {
  pub fn new(connected: bool) -> Self {
    Self {
      connected: Arc::new(AtomicBool::new(connected)),
      handlers: Arc::new(Handlers::default()),
    }
  }

  /// Record a platform transition and notify subscribers if it changed.
  pub fn set_connected(&self, connected: bool) {
    let previous = self.connected.swap(connected, Ordering::SeqCst);
    if previous == connected {
      return;
    }

    let event = if connected {
      SignalEvent::Connected
    } else {
      SignalEvent::Disconnected
    };

    // Snapshot so handlers may (un)subscribe without deadlocking
    let handlers: Vec<SignalHandler> = self
      .handlers
      .map
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .cloned()
      .collect();

    for handler in handlers {
      handler(event);
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self
      .handlers
      .map
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }
}

impl NetworkSignal for ManualSignal {
  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  fn subscribe(&self, handler: SignalHandler) -> SubscriptionToken {
    let id = self.handlers.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .handlers
      .map
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, handler);

    let handlers: Weak<Handlers> = Arc::downgrade(&self.handlers);
    SubscriptionToken::new(move || {
      if let Some(handlers) = handlers.upgrade() {
        handlers
          .map
          .lock()
          .unwrap_or_else(PoisonError::into_inner)
          .remove(&id);
      }
    })
  }
}
