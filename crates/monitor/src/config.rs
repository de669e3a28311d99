//! Reconnection configuration.
//!
//! The serialized surface uses short key names (`path`, `auto`,
//! `delay`, `multiplier`, `timeout`, `maxDelay`, `maxTimes`) with durations
//! in milliseconds. Missing keys fall back to [`ReconnectConfig::default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default probe target.
pub const DEFAULT_PROBE_PATH: &str = "/favicon.ico";

/// Upper bound on the number of failed probes before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "MaxTimesRepr", into = "MaxTimesRepr")]
pub enum MaxAttempts {
    /// Give up once this many consecutive probes have failed.
    Limited(u32),
    /// Retry forever.
    #[default]
    Unbounded,
}

impl MaxAttempts {
    /// Whether `attempts` failed probes exhaust the budget.
    pub fn is_exhausted(self, attempts: u32) -> bool {
        match self {
            Self::Limited(max) => attempts >= max,
            Self::Unbounded => false,
        }
    }
}

/// Wire form of `maxTimes`: a count, `-1`, or the word `"unbounded"`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MaxTimesRepr {
    Count(i64),
    Word(String),
}

impl TryFrom<MaxTimesRepr> for MaxAttempts {
    type Error = ConfigError;

    fn try_from(repr: MaxTimesRepr) -> Result<Self, Self::Error> {
        match repr {
            MaxTimesRepr::Count(-1) => Ok(Self::Unbounded),
            MaxTimesRepr::Count(n) => u32::try_from(n)
                .map(Self::Limited)
                .map_err(|_| ConfigError::InvalidMaxTimes(n.to_string())),
            MaxTimesRepr::Word(w) if w.eq_ignore_ascii_case("unbounded") => Ok(Self::Unbounded),
            MaxTimesRepr::Word(w) => Err(ConfigError::InvalidMaxTimes(w)),
        }
    }
}

impl From<MaxAttempts> for MaxTimesRepr {
    fn from(max: MaxAttempts) -> Self {
        match max {
            MaxAttempts::Limited(n) => Self::Count(i64::from(n)),
            MaxAttempts::Unbounded => Self::Word("unbounded".into()),
        }
    }
}

/// Configuration for reachability probing with exponential backoff.
///
/// Immutable once handed to a monitor. Call [`validate`](Self::validate)
/// (or use [`from_json_str`](Self::from_json_str)) before use; the monitor
/// builder validates again and refuses to start on error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Probe target, resolved by the transport.
    pub path: String,
    /// Schedule retries automatically after a failed probe.
    #[serde(rename = "auto")]
    pub auto_retry: bool,
    /// Delay before the first retry.
    #[serde(rename = "delay", with = "millis")]
    pub initial_delay: Duration,
    /// Growth factor applied to the delay after every scheduled retry.
    #[serde(rename = "multiplier")]
    pub backoff_multiplier: f64,
    /// Backoff cap.
    #[serde(rename = "maxDelay", with = "millis")]
    pub max_delay: Duration,
    /// In-flight probes are aborted after this long. Zero disables the limit.
    #[serde(rename = "timeout", with = "millis")]
    pub probe_timeout: Duration,
    /// Failed probes allowed before settling in `LIMITED`.
    #[serde(rename = "maxTimes")]
    pub max_attempts: MaxAttempts,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PROBE_PATH.into(),
            auto_retry: true,
            initial_delay: Duration::from_millis(5_000),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_millis(60_000),
            probe_timeout: Duration::from_millis(30_000),
            max_attempts: MaxAttempts::Unbounded,
        }
    }
}

impl ReconnectConfig {
    /// Parses a JSON object and validates the result.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the scheduler relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.trim().is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        if self.initial_delay.is_zero() {
            return Err(ConfigError::NonPositiveDelay);
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::MultiplierBelowOne(self.backoff_multiplier));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::MaxDelayBelowDelay {
                delay_ms: self.initial_delay.as_millis(),
                max_ms: self.max_delay.as_millis(),
            });
        }
        Ok(())
    }

    /// The probe timeout, or `None` when probes may run indefinitely.
    pub fn timeout_limit(&self) -> Option<Duration> {
        (!self.probe_timeout.is_zero()).then_some(self.probe_timeout)
    }
}

/// Serde adapter for durations expressed as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
