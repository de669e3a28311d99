//! Network connectivity monitor.
//!
//! Classifies connectivity as online, offline, or limited by combining a
//! platform link signal with active reachability probes, and retries
//! failed probes with capped exponential backoff.

pub(crate) mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod link;
pub mod listeners;
pub(crate) mod machine;
pub mod monitor;
pub(crate) mod probe;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;
pub mod types;

pub use clock::{Clock, TimerCallback, TimerHandle, TokioClock};
pub use config::{MaxAttempts, ReconnectConfig};
pub use error::{ConfigError, ProbeError};
pub use link::{LinkSignals, LinkSource, ManualLink};
pub use listeners::EventStream;
pub use monitor::{MonitorBuilder, NetworkMonitor};
pub use transport::{ProbeFuture, ProbeTransport};
pub use types::{ConnectivityState, LinkInfo, LinkSignal, MonitorSnapshot, NetworkEvent, Telemetry};
