//! Connectivity state machine.
//!
//! All shared state lives in one [`Core`] behind a mutex and is only
//! touched synchronously from three kinds of handlers: link signals,
//! retry timer fires, and probe completions. Callbacks hold a [`Weak`]
//! reference and check the `destroyed` flag before doing anything, so
//! work arriving after shutdown is dropped silently.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::{BackoffScheduler, Decision, TimerId};
use crate::clock::{Clock, TimerCallback};
use crate::config::ReconnectConfig;
use crate::error::ProbeError;
use crate::link::{LinkSignals, LinkSource};
use crate::listeners::{EventStream, Listeners};
use crate::probe::{Finished, Generation, ProbeController, ProbeReport, run_probe};
use crate::transport::ProbeTransport;
use crate::types::{ConnectivityState, LinkSignal, MonitorSnapshot, NetworkEvent, Telemetry};

/// Collaborators injected at construction.
pub(crate) struct Env {
    pub(crate) config: ReconnectConfig,
    pub(crate) link: Arc<dyn LinkSource>,
    pub(crate) transport: Arc<dyn ProbeTransport>,
    pub(crate) clock: Arc<dyn Clock>,
}

struct Core {
    /// `None` only between construction and boot.
    state: Option<ConnectivityState>,
    backoff: BackoffScheduler,
    probes: ProbeController,
    telemetry: Telemetry,
    listeners: Listeners,
    destroyed: bool,
}

pub(crate) struct StateMachine {
    env: Env,
    core: Mutex<Core>,
    /// Cancelled on shutdown to stop the link listener.
    detach: CancellationToken,
}

impl StateMachine {
    pub(crate) fn new(env: Env, listeners: Listeners) -> Arc<Self> {
        let backoff = BackoffScheduler::new(&env.config);
        Arc::new(Self {
            env,
            core: Mutex::new(Core {
                state: None,
                backoff,
                probes: ProbeController::default(),
                telemetry: Telemetry::default(),
                listeners,
                destroyed: false,
            }),
            detach: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn config(&self) -> &ReconnectConfig {
        &self.env.config
    }

    /// Attaches the link listener, derives the boot state from the link,
    /// and probes right away when the link claims to be up.
    ///
    /// Signals raised while booting queue up and are applied after the
    /// boot state.
    pub(crate) fn boot(self: &Arc<Self>) {
        let signals = self.env.link.attach();

        let mut core = self.lock();
        if self.env.link.is_link_up() {
            self.set_state(&mut core, ConnectivityState::Online);
            self.reconnect_locked(&mut core);
        } else {
            self.set_state(&mut core, ConnectivityState::Offline);
        }

        tokio::spawn(link_pump(
            Arc::downgrade(self),
            signals,
            self.detach.clone(),
        ));
    }

    /// Cancels any scheduled retry, restarts the backoff progression, and
    /// probes immediately.
    pub(crate) fn reconnect(self: &Arc<Self>) {
        let mut core = self.lock();
        if core.destroyed {
            return;
        }
        self.reconnect_locked(&mut core);
    }

    fn reconnect_locked(self: &Arc<Self>, core: &mut Core) {
        core.backoff.reset();
        self.start_probe(core);
    }

    fn start_probe(self: &Arc<Self>, core: &mut Core) {
        let ticket = core.probes.begin();
        debug!(
            generation = ticket.generation,
            path = %self.env.config.path,
            "probe issued"
        );

        if let Some(limit) = self.env.config.timeout_limit() {
            let signal = ticket.signal.clone();
            let timeout = self
                .env
                .clock
                .after(limit, Box::new(move || signal.cancel()));
            core.probes.arm_timeout(ticket.generation, timeout);
        }

        let machine = Arc::downgrade(self);
        let transport = self.env.transport.clone();
        let clock = self.env.clock.clone();
        let path = self.env.config.path.clone();
        tokio::spawn(async move {
            let report = run_probe(transport, clock, path, ticket.signal).await;
            if let Some(machine) = machine.upgrade() {
                machine.finish_probe(ticket.generation, report);
            }
        });
    }

    fn finish_probe(self: &Arc<Self>, generation: Generation, report: ProbeReport) {
        let mut core = self.lock();
        if core.destroyed {
            trace!(generation, "probe completed after shutdown");
            return;
        }
        let timed_out = match core.probes.finish(generation) {
            Finished::Current { timed_out } => timed_out,
            Finished::Stale => {
                trace!(generation, "discarding superseded probe");
                return;
            }
        };

        let elapsed_ms = duration_ms(report.elapsed);
        let status = match report.result {
            Ok(status) => {
                debug!(generation, status, elapsed_ms, "probe answered");
                self.set_state(&mut core, ConnectivityState::Online);
                status
            }
            Err(err) => {
                let err = if timed_out { ProbeError::TimedOut } else { err };
                debug!(generation, elapsed_ms, error = %err, "probe failed");
                self.handle_failure(&mut core);
                0
            }
        };

        if !core.probes.is_in_flight() {
            core.telemetry = Telemetry {
                last_probe_duration: report.elapsed,
                last_probe_status: status,
            };
        }
    }

    fn handle_failure(self: &Arc<Self>, core: &mut Core) {
        if !self.env.link.is_link_up() {
            self.set_state(core, ConnectivityState::Offline);
            return;
        }

        // Entering LIMITED resets the schedule, so it must precede the
        // failure bookkeeping below.
        self.set_state(core, ConnectivityState::Limited);

        let machine = Arc::downgrade(self);
        let decision = core.backoff.on_probe_failure(
            self.env.clock.as_ref(),
            move |id| -> TimerCallback {
                Box::new(move || {
                    if let Some(machine) = machine.upgrade() {
                        machine.on_retry_timer(id);
                    }
                })
            },
        );

        match decision {
            Decision::Scheduled { attempt, delay } => {
                info!(attempt, delay_ms = duration_ms(delay), "retry scheduled");
            }
            Decision::Disabled { attempt } => {
                debug!(attempt, "auto retry disabled, staying limited");
            }
            Decision::Exhausted { attempt } => {
                warn!(attempt, "retry limit reached, staying limited");
            }
        }
    }

    fn on_retry_timer(self: &Arc<Self>, id: TimerId) {
        let mut core = self.lock();
        if core.destroyed || !core.backoff.take_fired(id) {
            trace!(timer = id, "ignoring stale retry timer");
            return;
        }
        debug!(attempt = core.backoff.attempts(), "retry timer fired");
        self.start_probe(&mut core);
    }

    pub(crate) fn on_link_signal(self: &Arc<Self>, signal: LinkSignal) {
        let mut core = self.lock();
        if core.destroyed {
            return;
        }
        debug!(?signal, "link signal");

        let info = match signal {
            LinkSignal::Changed(info) => Some(info),
            LinkSignal::Up | LinkSignal::Down => self.env.link.link_info(),
        };
        if let Some(info) = info {
            core.listeners.emit(NetworkEvent::ConnectionChanged(info));
        }

        if self.env.link.is_link_up() {
            self.reconnect_locked(&mut core);
        } else {
            self.go_offline(&mut core);
        }
    }

    fn go_offline(&self, core: &mut Core) {
        core.backoff.reset();
        if core.probes.abort_all() {
            debug!("link down, aborted in-flight probe");
        }
        self.set_state(core, ConnectivityState::Offline);
    }

    /// The single mutation point for the connectivity state.
    ///
    /// No-op when unchanged. On a change the retry schedule is reset
    /// before listeners hear about it.
    fn set_state(&self, core: &mut Core, state: ConnectivityState) {
        if core.state == Some(state) {
            return;
        }
        core.backoff.reset();
        let previous = core.state.replace(state);
        info!(from = ?previous, to = %state, "connectivity changed");
        core.listeners.emit(NetworkEvent::Changed(state));
    }

    /// Detaches from the link, aborts the probe, and cancels the retry timer.
    pub(crate) fn shutdown(&self) {
        let mut core = self.lock();
        if core.destroyed {
            return;
        }
        core.destroyed = true;
        core.backoff.reset();
        core.probes.abort_all();
        let subscribers = core.listeners.len();
        core.listeners.clear();
        drop(core);

        self.detach.cancel();
        info!(subscribers, "monitor shut down");
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        let mut core = self.lock();
        if core.destroyed {
            let (_, rx) = mpsc::unbounded_channel();
            return rx;
        }
        core.listeners.subscribe()
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        self.lock().state.unwrap_or(ConnectivityState::Offline)
    }

    pub(crate) fn is_reconnecting(&self) -> bool {
        self.lock().probes.is_in_flight()
    }

    pub(crate) fn has_timer(&self) -> bool {
        self.lock().backoff.has_timer()
    }

    pub(crate) fn remaining(&self) -> Option<Duration> {
        let now = self.env.clock.now();
        self.lock().backoff.remaining(now)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.lock().backoff.attempts()
    }

    pub(crate) fn telemetry(&self) -> Telemetry {
        self.lock().telemetry
    }

    pub(crate) fn snapshot(&self) -> MonitorSnapshot {
        let now = self.env.clock.now();
        let core = self.lock();
        MonitorSnapshot {
            state: core.state.unwrap_or(ConnectivityState::Offline),
            is_reconnecting: core.probes.is_in_flight(),
            has_timer: core.backoff.has_timer(),
            remaining_ms: core.backoff.remaining(now).map(duration_ms),
            attempts: core.backoff.attempts(),
            last_reconnect_duration_ms: duration_ms(core.telemetry.last_probe_duration),
            last_reconnect_status: core.telemetry.last_probe_status,
        }
    }
}

/// Forwards link signals to the machine until detached.
async fn link_pump(
    machine: Weak<StateMachine>,
    mut signals: LinkSignals,
    detach: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = detach.cancelled() => break,
            signal = signals.recv() => {
                let Some(signal) = signal else {
                    debug!("link source closed");
                    break;
                };
                let Some(machine) = machine.upgrade() else {
                    break;
                };
                machine.on_link_signal(signal);
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
