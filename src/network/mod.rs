//! Network state modeling.
//!
//! - [`NetworkMonitor`] owns the process-wide [`NetworkState`]
//! - [`NetworkSignal`] is the host-facing capability for online/offline events
//! - [`Probe`] is a cheap backend check used to classify connection quality

mod monitor;
mod probe;
mod signal;
mod state;

pub use monitor::{NetworkMonitor, ProbeOutcome, RecoverHandle};
pub use probe::{HttpProbe, Probe};
pub use signal::{ManualSignal, NetworkSignal, SignalEvent, SignalHandler, SubscriptionToken};
pub use state::{ConnectionQuality, Connectivity, NetworkState};
