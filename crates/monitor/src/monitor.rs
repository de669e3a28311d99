//! Public entry point: builds, drives, and tears down the state machine.
//!
//! A [`NetworkMonitor`] owns one connectivity state machine. It reads the
//! link state at boot, probes when the link claims to be up, retries with
//! exponential backoff after failures, and reports every state change to
//! its subscribers.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, TokioClock};
use crate::config::ReconnectConfig;
use crate::error::ConfigError;
use crate::link::LinkSource;
use crate::listeners::{EventStream, Listeners};
use crate::machine::{Env, StateMachine};
use crate::transport::ProbeTransport;
use crate::types::{ConnectivityState, MonitorSnapshot};

/// Configures a [`NetworkMonitor`] before it boots.
pub struct MonitorBuilder {
    config: ReconnectConfig,
    clock: Arc<dyn Clock>,
    listeners: Listeners,
}

impl MonitorBuilder {
    /// Replaces the default [`TokioClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Subscribes before boot, so the boot state is delivered too.
    pub fn subscribe(&mut self) -> EventStream {
        self.listeners.subscribe()
    }

    /// Validates the config and boots the monitor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        self,
        link: Arc<dyn LinkSource>,
        transport: Arc<dyn ProbeTransport>,
    ) -> Result<NetworkMonitor, ConfigError> {
        self.config.validate()?;
        let env = Env {
            config: self.config,
            link,
            transport,
            clock: self.clock,
        };
        let machine = StateMachine::new(env, self.listeners);
        machine.boot();
        Ok(NetworkMonitor { machine })
    }
}

/// Connectivity monitor.
///
/// Dropping the monitor shuts it down.
pub struct NetworkMonitor {
    machine: Arc<StateMachine>,
}

impl NetworkMonitor {
    pub fn builder(config: ReconnectConfig) -> MonitorBuilder {
        MonitorBuilder {
            config,
            clock: Arc::new(TokioClock),
            listeners: Listeners::default(),
        }
    }

    /// Boots a monitor with the default clock and no pre-boot subscribers.
    pub fn start(
        config: ReconnectConfig,
        link: Arc<dyn LinkSource>,
        transport: Arc<dyn ProbeTransport>,
    ) -> Result<Self, ConfigError> {
        Self::builder(config).start(link, transport)
    }

    /// Forces a probe now.
    ///
    /// Cancels any scheduled retry and restarts the backoff progression.
    /// Works in every state, whether or not auto-retry is enabled.
    pub fn reconnect(&self) {
        self.machine.reconnect();
    }

    /// Receives future events. The stream ends after shutdown.
    pub fn subscribe(&self) -> EventStream {
        self.machine.subscribe()
    }

    pub fn config(&self) -> &ReconnectConfig {
        self.machine.config()
    }

    pub fn state(&self) -> ConnectivityState {
        self.machine.state()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    pub fn is_offline(&self) -> bool {
        self.state().is_offline()
    }

    pub fn is_limited(&self) -> bool {
        self.state().is_limited()
    }

    /// Whether a probe is in flight.
    pub fn is_reconnecting(&self) -> bool {
        self.machine.is_reconnecting()
    }

    /// Whether a retry is scheduled.
    pub fn has_timer(&self) -> bool {
        self.machine.has_timer()
    }

    /// Time until the scheduled retry; `None` when none is scheduled.
    pub fn remaining(&self) -> Option<Duration> {
        self.machine.remaining()
    }

    /// Failed probes counted since the last reset.
    pub fn attempts(&self) -> u32 {
        self.machine.attempts()
    }

    pub fn last_reconnect_duration(&self) -> Duration {
        self.machine.telemetry().last_probe_duration
    }

    /// Status of the last reported probe; `0` means no response.
    pub fn last_reconnect_status(&self) -> u16 {
        self.machine.telemetry().last_probe_status
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.machine.snapshot()
    }

    /// Detaches from the link source, aborts the in-flight probe, and
    /// cancels the scheduled retry. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.machine.shutdown();
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.machine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use crate::config::MaxAttempts;
    use crate::link::{LinkSignals, ManualLink};
    use crate::testing::{PendingProbe, ScriptedTransport};
    use crate::types::{LinkInfo, LinkSignal, NetworkEvent};

    use crate::types::ConnectivityState::{Limited, Offline, Online};

    struct Harness {
        monitor: NetworkMonitor,
        transport: Arc<ScriptedTransport>,
        requests: mpsc::UnboundedReceiver<PendingProbe>,
        events: EventStream,
    }

    impl Harness {
        async fn next_probe(&mut self) -> PendingProbe {
            self.requests.recv().await.expect("transport dropped")
        }

        fn events(&mut self) -> Vec<NetworkEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// `remaining` is set exactly when a timer is pending and never
        /// exceeds the delay that timer was scheduled with.
        fn assert_timer_invariant(&self, scheduled: Option<Duration>) {
            let snapshot = self.monitor.snapshot();
            assert_eq!(snapshot.remaining_ms.is_some(), snapshot.has_timer);
            assert_eq!(snapshot.has_timer, scheduled.is_some());
            assert!(self.monitor.remaining() <= scheduled);
        }
    }

    fn start(config: ReconnectConfig, link: Arc<dyn LinkSource>) -> Harness {
        let (transport, requests) = ScriptedTransport::new();
        let mut builder = NetworkMonitor::builder(config);
        let events = builder.subscribe();
        let monitor = builder.start(link, transport.clone()).unwrap();
        Harness {
            monitor,
            transport,
            requests,
            events,
        }
    }

    /// Defaults with the probe timeout disabled, so paused time never
    /// aborts a probe the test is still holding.
    fn no_timeout() -> ReconnectConfig {
        ReconnectConfig {
            probe_timeout: Duration::ZERO,
            ..ReconnectConfig::default()
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    /// Link whose status flips without notifying anyone.
    struct SilentLink {
        up: AtomicBool,
    }

    impl LinkSource for SilentLink {
        fn is_link_up(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn attach(&self) -> LinkSignals {
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        }
    }

    /// Link that drops while the monitor is reading it at boot: the first
    /// status read is slow and still says up, the signal is already queued.
    struct LinkLostDuringBoot {
        reads: AtomicUsize,
    }

    impl LinkSource for LinkLostDuringBoot {
        fn is_link_up(&self) -> bool {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(100));
                true
            } else {
                false
            }
        }

        fn attach(&self) -> LinkSignals {
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(LinkSignal::Down).unwrap();
            rx
        }
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let (transport, _requests) = ScriptedTransport::new();
        let config = ReconnectConfig {
            backoff_multiplier: 0.9,
            ..ReconnectConfig::default()
        };
        let result = NetworkMonitor::start(config, Arc::new(ManualLink::new(true)), transport);
        assert!(matches!(result, Err(ConfigError::MultiplierBelowOne(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn boot_online_and_probe_succeeds() {
        let mut h = start(no_timeout(), Arc::new(ManualLink::new(true)));

        assert_eq!(h.monitor.state(), Online);
        assert!(h.monitor.is_reconnecting());

        let probe = h.next_probe().await;
        assert_eq!(probe.path, "/favicon.ico");
        assert!(probe.respond(200));
        settle().await;

        assert!(h.monitor.is_online());
        assert!(!h.monitor.is_reconnecting());
        assert!(!h.monitor.has_timer());
        assert_eq!(h.monitor.last_reconnect_status(), 200);
        assert_eq!(h.events(), [NetworkEvent::Changed(Online)]);
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_still_counts_as_reachable() {
        let mut h = start(no_timeout(), Arc::new(ManualLink::new(true)));

        h.next_probe().await.respond(404);
        settle().await;

        assert!(h.monitor.is_online());
        assert_eq!(h.monitor.last_reconnect_status(), 404);
        assert_eq!(h.monitor.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn records_probe_duration() {
        let mut h = start(no_timeout(), Arc::new(ManualLink::new(true)));

        let probe = h.next_probe().await;
        tokio::time::advance(Duration::from_millis(1_500)).await;
        probe.respond(204);
        settle().await;

        assert_eq!(h.monitor.last_reconnect_duration(), Duration::from_millis(1_500));
        assert_eq!(h.monitor.last_reconnect_status(), 204);
    }

    #[tokio::test(start_paused = true)]
    async fn boot_offline_waits_for_link() {
        let link = Arc::new(ManualLink::new(false));
        let mut h = start(no_timeout(), link.clone());

        assert!(h.monitor.is_offline());
        assert!(!h.monitor.is_reconnecting());
        settle().await;
        assert_eq!(h.transport.issued(), 0);

        link.set_link_up(true);
        settle().await;
        assert!(h.monitor.is_reconnecting());
        // Stays offline until the probe resolves.
        assert!(h.monitor.is_offline());

        h.next_probe().await.respond(200);
        settle().await;
        assert_eq!(
            h.events(),
            [NetworkEvent::Changed(Offline), NetworkEvent::Changed(Online)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_until_the_attempt_cap() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(5_000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(60_000),
            max_attempts: MaxAttempts::Limited(3),
            ..no_timeout()
        };
        let mut h = start(config, Arc::new(ManualLink::new(true)));
        let origin = Instant::now();

        let scheduled = [
            Some(Duration::from_millis(5_000)),
            Some(Duration::from_millis(10_000)),
            None,
        ];
        let mut issued_at = Vec::new();
        for delay in scheduled {
            let probe = h.next_probe().await;
            issued_at.push(origin.elapsed().as_millis());
            assert!(probe.fail());
            settle().await;
            h.assert_timer_invariant(delay);
            assert!(h.monitor.is_limited());
        }

        assert_eq!(issued_at, [0, 5_000, 15_000]);
        assert!(!h.monitor.has_timer());
        assert_eq!(h.monitor.remaining(), None);
        assert_eq!(h.monitor.attempts(), 3);
        assert_eq!(h.monitor.last_reconnect_status(), 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;
        assert!(h.requests.try_recv().is_err());
        assert_eq!(h.transport.issued(), 3);
        assert_eq!(
            h.events(),
            [NetworkEvent::Changed(Online), NetworkEvent::Changed(Limited)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let mut h = start(no_timeout(), Arc::new(ManualLink::new(true)));
        let origin = Instant::now();

        let mut expected = Duration::ZERO;
        let mut delay = Duration::from_millis(5_000);
        for _ in 0..4 {
            h.next_probe().await.fail();
            settle().await;
            h.assert_timer_invariant(Some(delay));
            assert_eq!(h.monitor.remaining(), Some(delay));
            expected += delay;
            delay = delay.mul_f64(1.5).min(Duration::from_secs(60));
        }

        h.next_probe().await.respond(200);
        assert_eq!(origin.elapsed(), expected);
        settle().await;

        assert!(h.monitor.is_online());
        assert_eq!(h.monitor.attempts(), 0);
        assert!(!h.monitor.has_timer());
        assert_eq!(h.transport.issued(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let mut h = start(no_timeout(), Arc::new(ManualLink::new(true)));

        assert_eq!(h.monitor.remaining(), None);
        h.next_probe().await.fail();
        settle().await;
        assert_eq!(h.monitor.remaining(), Some(Duration::from_millis(5_000)));

        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert_eq!(h.monitor.remaining(), Some(Duration::from_millis(2_500)));
        h.assert_timer_invariant(Some(Duration::from_millis(5_000)));

        h.next_probe().await.respond(200);
        settle().await;
        assert_eq!(h.monitor.remaining(), None);
        h.assert_timer_invariant(None);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_reconnect_supersedes_scheduled_retry() {
        let mut h = start(no_timeout(), Arc::new(ManualLink::new(true)));

        h.next_probe().await.fail();
        settle().await;
        assert!(h.monitor.has_timer());
        assert_eq!(h.monitor.attempts(), 1);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        let before = Instant::now();
        h.monitor.reconnect();
        assert!(!h.monitor.has_timer());
        assert_eq!(h.monitor.attempts(), 0);
        assert!(h.monitor.is_reconnecting());

        let probe = h.next_probe().await;
        assert_eq!(Instant::now(), before);
        probe.fail();
        settle().await;

        // The progression restarted from the initial delay.
        assert_eq!(h.monitor.attempts(), 1);
        assert_eq!(h.monitor.remaining(), Some(Duration::from_millis(5_000)));

        // The old timer would have fired 4 s from here; it must not.
        tokio::time::advance(Duration::from_millis(4_500)).await;
        settle().await;
        assert!(h.requests.try_recv().is_err());
        assert_eq!(h.transport.issued(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn link_down_mid_probe_goes_offline() {
        let link = Arc::new(ManualLink::new(true));
        let mut h = start(no_timeout(), link.clone());

        let probe = h.next_probe().await;
        link.set_link_up(false);
        settle().await;

        assert!(h.monitor.is_offline());
        assert!(!h.monitor.is_reconnecting());
        assert!(!h.monitor.has_timer());
        assert!(probe.is_cancelled());

        // A late answer from the aborted probe changes nothing.
        probe.respond(200);
        settle().await;
        assert!(h.monitor.is_offline());
        assert_eq!(h.monitor.last_reconnect_status(), 0);
        assert_eq!(
            h.events(),
            [NetworkEvent::Changed(Online), NetworkEvent::Changed(Offline)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn link_down_clears_scheduled_retry() {
        let link = Arc::new(ManualLink::new(true));
        let mut h = start(no_timeout(), link.clone());

        h.next_probe().await.fail();
        settle().await;
        assert!(h.monitor.has_timer());

        link.set_link_up(false);
        settle().await;
        assert!(h.monitor.is_offline());
        assert!(!h.monitor.has_timer());
        assert_eq!(h.monitor.attempts(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(h.transport.issued(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn link_loss_during_boot_lands_after_boot_state() {
        let link = Arc::new(LinkLostDuringBoot {
            reads: AtomicUsize::new(0),
        });
        let mut h = start(no_timeout(), link);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.monitor.is_offline() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("link loss was never applied");

        // Whatever reached the transport was aborted; answering it is a no-op.
        while let Ok(pending) = h.requests.try_recv() {
            pending.respond(200);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.monitor.is_offline());
        assert!(!h.monitor.is_reconnecting());
        assert_eq!(
            h.events(),
            [NetworkEvent::Changed(Online), NetworkEvent::Changed(Offline)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_silent_link_loss_reports_offline() {
        let link = Arc::new(SilentLink {
            up: AtomicBool::new(true),
        });
        let mut h = start(no_timeout(), link.clone());

        let probe = h.next_probe().await;
        link.up.store(false, Ordering::SeqCst);
        probe.fail();
        settle().await;

        assert!(h.monitor.is_offline());
        assert!(!h.monitor.has_timer());
        assert_eq!(h.monitor.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_reconnects_leave_one_live_probe() {
        let mut h = start(no_timeout(), Arc::new(ManualLink::new(true)));

        let first = h.next_probe().await;
        for _ in 0..4 {
            h.monitor.reconnect();
        }
        let last = h.next_probe().await;
        settle().await;

        assert!(first.is_cancelled());
        assert!(!last.is_cancelled());
        // Superseded before they ever reached the transport.
        assert!(h.requests.try_recv().is_err());
        assert_eq!(h.transport.issued(), 2);

        assert!(!first.respond(500));
        assert!(last.respond(204));
        settle().await;

        assert!(!h.monitor.is_reconnecting());
        assert_eq!(h.monitor.last_reconnect_status(), 204);
        assert_eq!(h.events(), [NetworkEvent::Changed(Online)]);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_counts_as_failure() {
        let config = ReconnectConfig {
            probe_timeout: Duration::from_millis(1_000),
            ..ReconnectConfig::default()
        };
        let mut h = start(config, Arc::new(ManualLink::new(true)));

        let probe = h.next_probe().await;
        tokio::time::advance(Duration::from_millis(1_000)).await;
        settle().await;

        assert!(probe.is_cancelled());
        assert!(h.monitor.is_limited());
        assert!(h.monitor.has_timer());
        assert_eq!(h.monitor.attempts(), 1);
        assert_eq!(h.monitor.last_reconnect_status(), 0);
        assert_eq!(h.monitor.last_reconnect_duration(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_retry_off_stays_limited_but_honours_reconnect() {
        let config = ReconnectConfig {
            auto_retry: false,
            ..no_timeout()
        };
        let mut h = start(config, Arc::new(ManualLink::new(true)));

        h.next_probe().await.fail();
        settle().await;
        assert!(h.monitor.is_limited());
        assert!(!h.monitor.has_timer());

        tokio::time::sleep(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(h.transport.issued(), 1);

        h.monitor.reconnect();
        h.next_probe().await.respond(200);
        settle().await;
        assert!(h.monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_attempts_gives_up_immediately() {
        let config = ReconnectConfig {
            max_attempts: MaxAttempts::Limited(0),
            ..no_timeout()
        };
        let mut h = start(config, Arc::new(ManualLink::new(true)));

        h.next_probe().await.fail();
        settle().await;

        assert!(h.monitor.is_limited());
        assert!(!h.monitor.has_timer());
        assert_eq!(h.monitor.remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn link_change_revalidates_and_reports_metadata() {
        let link = Arc::new(ManualLink::with_change_events(true, LinkInfo::default()));
        let mut h = start(no_timeout(), link.clone());

        h.next_probe().await.respond(200);
        settle().await;
        h.events();

        let info = LinkInfo {
            effective_type: Some("3g".into()),
            downlink_mbps: Some(1.5),
            rtt_ms: Some(300),
            save_data: false,
        };
        link.notify_change(info.clone());
        settle().await;

        assert!(h.monitor.is_online());
        assert!(h.monitor.is_reconnecting());
        assert_eq!(h.events(), [NetworkEvent::ConnectionChanged(info.clone())]);

        link.set_link_up(false);
        settle().await;
        assert_eq!(
            h.events(),
            [
                NetworkEvent::ConnectionChanged(info),
                NetworkEvent::Changed(Offline)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_final() {
        let link = Arc::new(ManualLink::new(true));
        let mut h = start(no_timeout(), link.clone());

        let probe = h.next_probe().await;
        h.monitor.shutdown();
        h.monitor.shutdown();
        settle().await;

        assert!(probe.is_cancelled());
        assert!(!probe.respond(200));
        assert!(!h.monitor.is_reconnecting());
        assert_eq!(link.listener_count(), 0);

        // Nothing moves after teardown.
        h.monitor.reconnect();
        link.set_link_up(false);
        settle().await;
        assert_eq!(h.monitor.state(), Online);
        assert_eq!(h.monitor.last_reconnect_status(), 0);
        assert_eq!(h.transport.issued(), 1);

        assert_eq!(h.events.recv().await, Some(NetworkEvent::Changed(Online)));
        assert_eq!(h.events.recv().await, None);
        assert!(h.monitor.subscribe().recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_scheduled_retry() {
        let mut h = start(no_timeout(), Arc::new(ManualLink::new(true)));

        h.next_probe().await.fail();
        settle().await;
        assert!(h.monitor.has_timer());

        h.monitor.shutdown();
        assert!(!h.monitor.has_timer());

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(h.transport.issued(), 1);
        assert!(h.monitor.is_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_monitor_tears_down() {
        let link = Arc::new(ManualLink::new(true));
        let Harness {
            monitor,
            mut requests,
            ..
        } = start(no_timeout(), link.clone());

        let probe = requests.recv().await.unwrap();
        drop(monitor);
        settle().await;

        assert!(probe.is_cancelled());
        assert_eq!(link.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_sees_only_later_events() {
        let mut h = start(no_timeout(), Arc::new(ManualLink::new(true)));
        let mut late = h.monitor.subscribe();

        h.next_probe().await.fail();
        settle().await;

        assert_eq!(late.try_recv().unwrap(), NetworkEvent::Changed(Limited));
        assert!(late.try_recv().is_err());

        let snapshot = h.monitor.snapshot();
        assert_eq!(snapshot.state, Limited);
        assert!(snapshot.has_timer);
        assert_eq!(snapshot.remaining_ms, Some(5_000));
        assert_eq!(snapshot.attempts, 1);
        assert_eq!(snapshot.last_reconnect_status, 0);
    }
}
