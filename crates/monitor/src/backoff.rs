//! Backoff scheduler: retry delays, attempt budget, and the retry timer.
//!
//! Delays follow `delay[0] = initial`, `delay[i+1] = min(delay[i] × multiplier, max)`.
//! At most one retry timer is pending at any time; [`BackoffScheduler::reset`]
//! cancels it together with the attempt count and delay progression.

use std::time::Duration;

use tokio::time::Instant;

use crate::clock::{Clock, TimerCallback, TimerHandle};
use crate::config::{MaxAttempts, ReconnectConfig};

/// Identifies one armed retry timer, so a late fire can be told apart
/// from the current one.
pub(crate) type TimerId = u64;

/// What to do after a failed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// A retry fires after `delay`.
    Scheduled { attempt: u32, delay: Duration },
    /// Auto-retry is off.
    Disabled { attempt: u32 },
    /// The attempt budget is spent.
    Exhausted { attempt: u32 },
}

#[derive(Debug)]
struct PendingRetry {
    id: TimerId,
    handle: TimerHandle,
    fire_at: Instant,
}

/// Retry schedule owned by the state machine.
#[derive(Debug)]
pub(crate) struct BackoffScheduler {
    auto_retry: bool,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    max_attempts: MaxAttempts,
    attempts: u32,
    /// Delay for the next retry. `None` until the first retry is scheduled.
    current_delay: Option<Duration>,
    pending: Option<PendingRetry>,
    last_id: TimerId,
}

impl BackoffScheduler {
    pub(crate) fn new(config: &ReconnectConfig) -> Self {
        Self {
            auto_retry: config.auto_retry,
            initial_delay: config.initial_delay,
            multiplier: config.backoff_multiplier,
            max_delay: config.max_delay,
            max_attempts: config.max_attempts,
            attempts: 0,
            current_delay: None,
            pending: None,
            last_id: 0,
        }
    }

    /// Records a failed probe and arms the next retry if the budget allows.
    ///
    /// `on_fire` builds the timer callback for the given timer id; the
    /// callback must hand that id back to [`take_fired`](Self::take_fired).
    pub(crate) fn on_probe_failure(
        &mut self,
        clock: &dyn Clock,
        on_fire: impl FnOnce(TimerId) -> TimerCallback,
    ) -> Decision {
        self.attempts = self.attempts.saturating_add(1);
        let attempt = self.attempts;

        if !self.auto_retry {
            return Decision::Disabled { attempt };
        }
        if self.max_attempts.is_exhausted(attempt) {
            self.cancel_pending();
            return Decision::Exhausted { attempt };
        }

        let delay = self.current_delay.unwrap_or(self.initial_delay);
        let next_delay = self.grow(delay);

        self.cancel_pending();
        self.last_id = self.last_id.wrapping_add(1);
        let id = self.last_id;
        let handle = clock.after(delay, on_fire(id));
        self.pending = Some(PendingRetry {
            id,
            handle,
            fire_at: clock.now() + delay,
        });
        self.current_delay = Some(next_delay);

        Decision::Scheduled { attempt, delay }
    }

    /// Cancels the pending timer and forgets all progress.
    pub(crate) fn reset(&mut self) {
        self.cancel_pending();
        self.attempts = 0;
        self.current_delay = None;
    }

    /// Claims a fired timer. Returns `false` for a timer that was
    /// cancelled or replaced after it started firing.
    ///
    /// Attempt count and delay progression are kept.
    pub(crate) fn take_fired(&mut self, id: TimerId) -> bool {
        match &self.pending {
            Some(pending) if pending.id == id && !pending.handle.is_cancelled() => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Time until the pending retry fires, `None` when nothing is pending.
    pub(crate) fn remaining(&self, now: Instant) -> Option<Duration> {
        self.pending
            .as_ref()
            .map(|p| p.fire_at.saturating_duration_since(now))
    }

    pub(crate) fn has_timer(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    #[cfg(test)]
    pub(crate) fn current_delay(&self) -> Option<Duration> {
        self.current_delay
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.handle.cancel();
        }
    }

    fn grow(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
