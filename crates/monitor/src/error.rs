//! Error types for the connectivity monitor.

/// Errors raised while building or validating a [`ReconnectConfig`].
///
/// [`ReconnectConfig`]: crate::config::ReconnectConfig
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("probe path must not be empty")]
    EmptyPath,

    #[error("initial delay must be greater than zero")]
    NonPositiveDelay,

    #[error("backoff multiplier must be a finite number >= 1 (got {0})")]
    MultiplierBelowOne(f64),

    #[error("max delay ({max_ms} ms) is below the initial delay ({delay_ms} ms)")]
    MaxDelayBelowDelay { delay_ms: u128, max_ms: u128 },

    #[error("invalid maxTimes value: {0}")]
    InvalidMaxTimes(String),
}

/// Errors reported by a [`ProbeTransport`](crate::transport::ProbeTransport).
///
/// Every variant counts as "probe failed" unless the probe was superseded,
/// in which case the result is discarded before it is looked at.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("probe timed out")]
    TimedOut,

    #[error("probe cancelled")]
    Cancelled,
}
