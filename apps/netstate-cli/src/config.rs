//! CLI configuration file.
//!
//! ```json
//! { "url": "http://192.168.1.1", "reconnect": { "delay": 2000, "maxTimes": 10 } }
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use netstate_monitor::ReconnectConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_FILE: &str = "netstate.json";
const CONFIG_ENV: &str = "NETSTATE_CONFIG";

/// Contents of `netstate.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Origin the probe path is resolved against.
    pub url: String,
    pub reconnect: ReconnectConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            url: "http://connectivitycheck.gstatic.com".into(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads and validates `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };

        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        config
            .reconnect
            .validate()
            .with_context(|| format!("invalid reconnect settings in {}", path.display()))?;
        Ok(config)
    }
}

/// `$NETSTATE_CONFIG`, or `netstate.json` in the working directory.
pub fn default_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
