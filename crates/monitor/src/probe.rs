//! Probe controller: at most one active reachability probe.
//!
//! Starting a probe aborts the previous one in the same synchronous step,
//! so a superseded probe is already unregistered by the time its
//! completion runs and is recognised by its stale generation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, TimerHandle};
use crate::error::ProbeError;
use crate::transport::ProbeTransport;

/// Monotonic probe identifier.
pub(crate) type Generation = u64;

#[derive(Debug)]
struct ActiveProbe {
    generation: Generation,
    signal: CancellationToken,
    timeout: Option<TimerHandle>,
}

impl ActiveProbe {
    fn abort(self) {
        self.signal.cancel();
        if let Some(timeout) = self.timeout {
            timeout.cancel();
        }
    }
}

/// Registration handed to the task that runs a probe.
#[derive(Debug, Clone)]
pub(crate) struct ProbeTicket {
    pub(crate) generation: Generation,
    pub(crate) signal: CancellationToken,
}

/// How a completing probe relates to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finished {
    /// The active probe. `timed_out` is set when its timeout aborted it.
    Current { timed_out: bool },
    /// Superseded or aborted; its result must be ignored.
    Stale,
}

#[derive(Debug, Default)]
pub(crate) struct ProbeController {
    last_generation: Generation,
    active: Option<ActiveProbe>,
}

impl ProbeController {
    /// Aborts the in-flight probe, if any, and registers a new one.
    pub(crate) fn begin(&mut self) -> ProbeTicket {
        self.abort_all();
        self.last_generation = self.last_generation.wrapping_add(1);
        let signal = CancellationToken::new();
        self.active = Some(ActiveProbe {
            generation: self.last_generation,
            signal: signal.clone(),
            timeout: None,
        });
        ProbeTicket {
            generation: self.last_generation,
            signal,
        }
    }

    /// Attaches the timeout timer of a probe so it is cancelled with it.
    pub(crate) fn arm_timeout(&mut self, generation: Generation, timeout: TimerHandle) {
        match self.active.as_mut() {
            Some(active) if active.generation == generation => active.timeout = Some(timeout),
            _ => timeout.cancel(),
        }
    }

    /// Aborts the in-flight probe. Returns whether there was one.
    pub(crate) fn abort_all(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                active.abort();
                true
            }
            None => false,
        }
    }

    /// Unregisters a completing probe.
    pub(crate) fn finish(&mut self, generation: Generation) -> Finished {
        match self.active.take() {
            Some(active) if active.generation == generation => {
                let timed_out = active.signal.is_cancelled();
                if let Some(timeout) = active.timeout {
                    timeout.cancel();
                }
                Finished::Current { timed_out }
            }
            other => {
                self.active = other;
                Finished::Stale
            }
        }
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.active.is_some()
    }
}

/// Result of one probe run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ProbeReport {
    pub(crate) result: Result<u16, ProbeError>,
    pub(crate) elapsed: Duration,
}

/// Runs a single probe until the transport answers or `signal` fires.
pub(crate) async fn run_probe(
    transport: Arc<dyn ProbeTransport>,
    clock: Arc<dyn Clock>,
    path: String,
    signal: CancellationToken,
) -> ProbeReport {
    let started = clock.now();
    let result = tokio::select! {
        biased;
        _ = signal.cancelled() => Err(ProbeError::Cancelled),
        result = transport.probe(&path, signal.clone()) => result,
    };
    ProbeReport {
        result,
        elapsed: clock.now().saturating_duration_since(started),
    }
}
