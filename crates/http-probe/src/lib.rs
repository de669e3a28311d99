//! HTTP reachability probe for `netstate-monitor`.
//!
//! Sends an uncached `HEAD` request for a small resource on the probe
//! origin. Any response, whatever its status, proves the network path
//! works; only a transport failure counts as unreachable.

use netstate_monitor::{ProbeError, ProbeFuture, ProbeTransport};
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::{Client, Url};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Errors building an [`HttpProbe`].
#[derive(Debug, thiserror::Error)]
pub enum HttpProbeError {
    #[error("invalid probe origin {0}")]
    InvalidUrl(String),

    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// [`ProbeTransport`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    base: String,
}

impl HttpProbe {
    /// Probes paths relative to `base`, e.g. `http://192.168.1.1:8080`.
    pub fn new(base: &str) -> Result<Self, HttpProbeError> {
        let client = Client::builder().build()?;
        Self::with_client(client, base)
    }

    /// Like [`new`](Self::new), reusing an existing client.
    pub fn with_client(client: Client, base: &str) -> Result<Self, HttpProbeError> {
        let url = Url::parse(base).map_err(|e| HttpProbeError::InvalidUrl(format!("{base}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HttpProbeError::InvalidUrl(format!(
                "{base}: unsupported scheme {}",
                url.scheme()
            )));
        }
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Full probe URL with a unique cache-busting query parameter.
    pub fn probe_url(&self, path: &str) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        let path = path.strip_prefix('/').unwrap_or(path);
        format!(
            "{}/{path}{separator}_={}",
            self.base,
            uuid::Uuid::new_v4().simple()
        )
    }
}

impl ProbeTransport for HttpProbe {
    fn probe<'a>(&'a self, path: &'a str, signal: CancellationToken) -> ProbeFuture<'a> {
        Box::pin(async move {
            let url = self.probe_url(path);
            trace!(%url, "HEAD");
            let request = self
                .client
                .head(&url)
                .header(CACHE_CONTROL, "no-cache")
                .header(PRAGMA, "no-cache")
                .send();

            tokio::select! {
                _ = signal.cancelled() => Err(ProbeError::Cancelled),
                response = request => match response {
                    Ok(response) => Ok(response.status().as_u16()),
                    Err(e) => Err(ProbeError::Transport(e.to_string())),
                },
            }
        })
    }
}
