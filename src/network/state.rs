use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Coarse reachability of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
  Online,
  /// The platform reported a disconnect
  Offline,
  /// The platform says online but probes keep failing
  Unstable,
}

/// Connection quality tier derived from probe latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
  Excellent,
  Good,
  Poor,
  Critical,
}

impl ConnectionQuality {
  /// `<500ms` Excellent, `<2000ms` Good, `<5000ms` Poor, otherwise Critical.
  pub fn from_latency(latency: Duration) -> Self {
    match latency.as_millis() {
      0..=499 => Self::Excellent,
      500..=1999 => Self::Good,
      2000..=4999 => Self::Poor,
      _ => Self::Critical,
    }
  }

  pub fn is_degraded(self) -> bool {
    matches!(self, Self::Poor | Self::Critical)
  }
}

/// Snapshot of the network as seen by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkState {
  pub connectivity: Connectivity,
  pub quality: ConnectionQuality,
  pub last_probe_latency_ms: Option<u64>,
  pub last_probe_at: Option<DateTime<Utc>>,
}

impl NetworkState {
  pub fn online() -> Self {
    Self {
      connectivity: Connectivity::Online,
      quality: ConnectionQuality::Excellent,
      last_probe_latency_ms: None,
      last_probe_at: None,
    }
  }

  pub fn is_online(&self) -> bool {
    self.connectivity == Connectivity::Online
  }

  /// Network I/O is likely to be slow or to fail.
  pub fn is_degraded(&self) -> bool {
    !self.is_online() || self.quality.is_degraded()
  }
}

impl Default for NetworkState {
  fn default() -> Self {
    Self::online()
  }
}
