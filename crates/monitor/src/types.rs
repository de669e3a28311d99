//! Public types for the connectivity monitor.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reported reachability of the host's network connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    /// Link is up and the last probe got a response.
    Online,
    /// The platform reports the link down.
    Offline,
    /// Link claims to be up but the probe endpoint is unreachable.
    Limited,
}

impl ConnectivityState {
    pub fn is_online(self) -> bool {
        self == Self::Online
    }

    pub fn is_offline(self) -> bool {
        self == Self::Offline
    }

    pub fn is_limited(self) -> bool {
        self == Self::Limited
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Limited => "LIMITED",
        })
    }
}

/// Characteristics of the current link, when the platform exposes them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    /// Coarse link class such as `"4g"` or `"wifi"`.
    pub effective_type: Option<String>,
    /// Estimated downlink bandwidth.
    pub downlink_mbps: Option<f64>,
    /// Estimated round-trip time.
    pub rtt_ms: Option<u64>,
    /// The user asked for reduced data usage.
    pub save_data: bool,
}

/// Notification delivered by a [`LinkSource`](crate::link::LinkSource).
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSignal {
    /// The link came up.
    Up,
    /// The link went down.
    Down,
    /// Link characteristics changed; up/down is not implied.
    Changed(LinkInfo),
}

/// Events emitted by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// The connectivity state changed.
    Changed(ConnectivityState),
    /// The platform reported new link characteristics.
    ConnectionChanged(LinkInfo),
}

/// Outcome of the most recent probe that was allowed to report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
    /// Time from issue to completion.
    pub last_probe_duration: Duration,
    /// Response status, or `0` for no response (error, timeout, abort).
    pub last_probe_status: u16,
}

/// Consistent read of every observable at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub state: ConnectivityState,
    pub is_reconnecting: bool,
    pub has_timer: bool,
    /// Milliseconds until the next scheduled probe; absent when none is pending.
    pub remaining_ms: Option<u64>,
    pub attempts: u32,
    pub last_reconnect_duration_ms: u64,
    pub last_reconnect_status: u16,
}
