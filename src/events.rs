// Event fan-out from the messaging core to whoever wants to listen
// (UI, notification display, tests). The core never assumes a
// subscriber exists.

use tokio::sync::broadcast;

use crate::models::{DeliveryState, Message, MessageOrigin};

/// Events emitted by the messaging pipeline.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A message was inserted into the local history.
    MessageAdded {
        message: Message,
        origin: MessageOrigin,
    },
    /// A stored message changed its delivery state.
    DeliveryStateChanged {
        id: String,
        state: DeliveryState,
        error_text: Option<String>,
    },
    /// A short, user-visible status line. The texts are fixed strings
    /// that downstream consumers may match on.
    PassiveNotification { text: String },
    /// An inbound message that warrants a user-visible alert.
    ShowMessageNotification {
        contact_jid: String,
        contact_name: String,
        body: String,
    },
}

/// Broadcast bus for [`ClientEvent`]s. Cheap to clone; every clone emits
/// into the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        // A send error just means nobody is subscribed right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}
