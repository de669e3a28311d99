//! Probe transport seam.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;

/// Future returned by [`ProbeTransport::probe`]: the response status code.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<u16, ProbeError>> + Send + 'a>>;

/// Performs a single reachability probe.
///
/// Implementations must not cache responses and must report every
/// response status, including 4xx and 5xx, as `Ok`. Only the absence of a
/// response is an error. `signal` is cancelled on timeout or supersession
/// and the transport should abandon the request promptly when it is.
pub trait ProbeTransport: Send + Sync + 'static {
    fn probe<'a>(&'a self, path: &'a str, signal: CancellationToken) -> ProbeFuture<'a>;
}
