//! Deterministic fakes for exercising the monitor in tests.
//!
//! Available under `cfg(test)` and with the `test-util` feature.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, TimerCallback, TimerHandle};
use crate::error::ProbeError;
use crate::transport::{ProbeFuture, ProbeTransport};

/// A probe waiting for the test to decide its outcome.
#[derive(Debug)]
pub struct PendingProbe {
    pub path: String,
    signal: CancellationToken,
    responder: oneshot::Sender<Result<u16, ProbeError>>,
}

impl PendingProbe {
    /// Completes the probe with a response status.
    ///
    /// Returns `false` if the probe was already abandoned.
    pub fn respond(self, status: u16) -> bool {
        self.responder.send(Ok(status)).is_ok()
    }

    /// Completes the probe with a transport error.
    pub fn fail(self) -> bool {
        self.responder
            .send(Err(ProbeError::Transport("connection refused".into())))
            .is_ok()
    }

    /// Whether the monitor aborted this probe (timeout, supersession, teardown).
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}

/// Transport that hands every probe to the test as a [`PendingProbe`].
#[derive(Debug)]
pub struct ScriptedTransport {
    requests: mpsc::UnboundedSender<PendingProbe>,
    issued: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PendingProbe>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            requests: tx,
            issued: AtomicUsize::new(0),
        });
        (transport, rx)
    }

    /// Number of probes issued so far.
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

impl ProbeTransport for ScriptedTransport {
    fn probe<'a>(&'a self, path: &'a str, signal: CancellationToken) -> ProbeFuture<'a> {
        Box::pin(async move {
            self.issued.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            let pending = PendingProbe {
                path: path.to_string(),
                signal: signal.clone(),
                responder: tx,
            };
            if self.requests.send(pending).is_err() {
                return Err(ProbeError::Transport("test harness gone".into()));
            }
            tokio::select! {
                _ = signal.cancelled() => Err(ProbeError::Cancelled),
                outcome = rx => outcome.unwrap_or_else(|_| {
                    Err(ProbeError::Transport("probe dropped unanswered".into()))
                }),
            }
        })
    }
}

struct ManualTimer {
    due: Duration,
    cancel: CancellationToken,
    callback: TimerCallback,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    timers: Vec<ManualTimer>,
}

/// Clock that only moves when told to. Timers fire synchronously inside
/// [`advance`](Self::advance), in due order.
pub struct ManualClock {
    origin: Instant,
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ManualState::default()),
        }
    }

    /// Moves time forward by `by`, firing every timer that comes due.
    /// Returns the number of callbacks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.lock().elapsed + by;
        let mut fired = 0;
        loop {
            // Callbacks run unlocked so they may arm new timers.
            let next = {
                let mut state = self.lock();
                state.timers.retain(|t| !t.cancel.is_cancelled());
                let due = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| t.due)
                    .map(|(i, _)| i);
                due.map(|i| {
                    let timer = state.timers.remove(i);
                    state.elapsed = state.elapsed.max(timer.due);
                    timer
                })
            };
            match next {
                Some(timer) => {
                    (timer.callback)();
                    fired += 1;
                }
                None => break,
            }
        }
        self.lock().elapsed = target;
        fired
    }

    /// Timers armed and not yet cancelled or fired.
    pub fn pending(&self) -> usize {
        self.lock()
            .timers
            .iter()
            .filter(|t| !t.cancel.is_cancelled())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.lock().elapsed
    }

    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let cancel = CancellationToken::new();
        let mut state = self.lock();
        let due = state.elapsed + delay;
        state.timers.push(ManualTimer {
            due,
            cancel: cancel.clone(),
            callback,
        });
        TimerHandle::new(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_fires_in_due_order() {
        let clock = ManualClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, ms) in [("b", 200u64), ("a", 100), ("c", 300)] {
            let o = order.clone();
            clock.after(
                Duration::from_millis(ms),
                Box::new(move || o.lock().unwrap().push(label)),
            );
        }

        assert_eq!(clock.advance(Duration::from_millis(250)), 2);
        assert_eq!(*order.lock().unwrap(), ["a", "b"]);
        assert_eq!(clock.pending(), 1);
        assert_eq!(clock.now() - clock.origin, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn scripted_transport_reports_abandoned_probes() {
        let (transport, mut requests) = ScriptedTransport::new();
        let signal = CancellationToken::new();

        let t = transport.clone();
        let s = signal.clone();
        let probe = tokio::spawn(async move { t.probe("/ping", s).await });

        let pending = requests.recv().await.unwrap();
        assert_eq!(pending.path, "/ping");
        signal.cancel();

        assert_eq!(probe.await.unwrap(), Err(ProbeError::Cancelled));
        assert!(pending.is_cancelled());
        assert!(!pending.respond(200));
        assert_eq!(transport.issued(), 1);
    }
}
