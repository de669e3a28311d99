//! Timer source used for backoff retries and probe timeouts.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Work run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled timer. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancel: CancellationToken,
}

impl TimerHandle {
    /// Wraps the token a [`Clock`] implementation checks before firing.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Prevents the callback from running if it has not started yet.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Clock and timer source.
///
/// `after` must never invoke the callback synchronously: callers schedule
/// timers while holding the monitor's lock.
pub trait Clock: Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Runs `callback` once `delay` has elapsed, unless cancelled first.
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Production clock backed by the tokio timer wheel.
///
/// Honors paused test time. `after` spawns onto the current runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let deadline = Instant::now() + delay;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if !token.is_cancelled() {
                        callback();
                    }
                }
            }
        });
        TimerHandle::new(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        TokioClock.after(
            Duration::from_secs(5),
            Box::new(move || f.store(true, Ordering::SeqCst)),
        );

        tokio::time::advance(Duration::from_millis(4_999)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::advance(Duration::from_millis(1)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let handle = TokioClock.after(
            Duration::from_secs(1),
            Box::new(move || f.store(true, Ordering::SeqCst)),
        );

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());

        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!fired.load(Ordering::SeqCst));
    }
}
