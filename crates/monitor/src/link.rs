//! Platform link signal source.
//!
//! The monitor never inspects network interfaces itself. A [`LinkSource`]
//! tells it whether the link claims to be up and pushes [`LinkSignal`]s
//! whenever that may have changed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;

use crate::types::{LinkInfo, LinkSignal};

/// Receiving end of a link listener.
pub type LinkSignals = mpsc::UnboundedReceiver<LinkSignal>;

/// Source of link-level connectivity signals.
pub trait LinkSource: Send + Sync + 'static {
    /// Point-in-time link status.
    fn is_link_up(&self) -> bool;

    /// Attaches a listener. Dropping the receiver detaches it.
    fn attach(&self) -> LinkSignals;

    /// Latest link characteristics. `None` means the source has no
    /// change-event capability, and the monitor only reacts to up/down.
    fn link_info(&self) -> Option<LinkInfo> {
        None
    }
}

/// Host-driven link source.
///
/// The host (or a test) flips the link with [`set_link_up`](Self::set_link_up)
/// and reports characteristic changes with [`notify_change`](Self::notify_change).
#[derive(Debug)]
pub struct ManualLink {
    up: AtomicBool,
    /// `Some` when the source has the change-event capability.
    info: Mutex<Option<LinkInfo>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<LinkSignal>>>,
}

impl ManualLink {
    /// Link source without change events.
    pub fn new(up: bool) -> Self {
        Self {
            up: AtomicBool::new(up),
            info: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Link source that also reports link characteristics.
    pub fn with_change_events(up: bool, info: LinkInfo) -> Self {
        Self {
            info: Mutex::new(Some(info)),
            ..Self::new(up)
        }
    }

    /// Updates the link status, notifying listeners only on an actual change.
    pub fn set_link_up(&self, up: bool) {
        if self.up.swap(up, Ordering::SeqCst) != up {
            self.broadcast(if up { LinkSignal::Up } else { LinkSignal::Down });
        }
    }

    /// Records new link characteristics and notifies listeners.
    ///
    /// Ignored when the source was built without change events.
    pub fn notify_change(&self, info: LinkInfo) {
        {
            let mut current = self.info.lock().unwrap_or_else(PoisonError::into_inner);
            match current.as_mut() {
                Some(slot) => *slot = info.clone(),
                None => {
                    trace!("link source has no change events, ignoring");
                    return;
                }
            }
        }
        self.broadcast(LinkSignal::Changed(info));
    }

    /// Number of attached listeners still alive.
    pub fn listener_count(&self) -> usize {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|tx| !tx.is_closed());
        listeners.len()
    }

    fn broadcast(&self, signal: LinkSignal) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|tx| tx.send(signal.clone()).is_ok());
    }
}

impl LinkSource for ManualLink {
    fn is_link_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn attach(&self) -> LinkSignals {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn link_info(&self) -> Option<LinkInfo> {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
