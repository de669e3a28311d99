//! Listener registry for monitor events.

use tokio::sync::mpsc;

use crate::types::NetworkEvent;

/// Receiving end of a monitor subscription. Yields `None` after shutdown.
pub type EventStream = mpsc::UnboundedReceiver<NetworkEvent>;

/// Fan-out of [`NetworkEvent`]s to every live subscriber.
///
/// Sends never block, so events can be emitted while the state lock is
/// held and arrive in mutation order.
#[derive(Debug, Default)]
pub(crate) struct Listeners {
    senders: Vec<mpsc::UnboundedSender<NetworkEvent>>,
}

impl Listeners {
    pub(crate) fn subscribe(&mut self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    /// Delivers `event` to every subscriber, dropping the ones that hung up.
    pub(crate) fn emit(&mut self, event: NetworkEvent) {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drops every subscriber, ending their streams.
    pub(crate) fn clear(&mut self) {
        self.senders.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}
