// XMPP client module for magpie.
// This file holds the client shell: stanza routing and the glue between
// the wire and the messaging pipeline. The submodules are organized by
// concern (codec, carbons, receipts, outbound dispatch, roster).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, Mutex as TokioMutex};
use uuid::Uuid;

use async_trait::async_trait;
use tokio_xmpp::AsyncClient as XMPPAsyncClient;
use xmpp_parsers::Element;

pub mod carbons;
pub mod codec;
pub mod connection;
pub mod outbound;
pub mod receipts;
pub mod roster;

pub use codec::DecodeOutcome;
pub use outbound::{Dispatcher, StanzaSink};
pub use roster::RosterHandle;

use crate::events::{ClientEvent, EventBus};
use crate::models::{DeliveryState, Message, MessageMutation, MessageOrigin};
use crate::notifications::NotificationContext;
use crate::storage::MessageDb;

// Namespaces of the wire extensions in play.
pub mod custom_ns {
    pub const RECEIPTS: &str = "urn:xmpp:receipts";
    pub const CARBONS: &str = "urn:xmpp:carbons:2";
    pub const FORWARD: &str = "urn:xmpp:forward:0";
    pub const HINTS: &str = "urn:xmpp:hints";
    pub const DELAY: &str = "urn:xmpp:delay";
    pub const OOB: &str = "jabber:x:oob";
    pub const CORRECT: &str = "urn:xmpp:message-correct:0";
    pub const SPOILER: &str = "urn:xmpp:spoiler:0";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const ROSTER: &str = "jabber:iq:roster";
}

/// Strips the resource part from a JID.
pub fn bare_jid(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}

type ClientSlot = Arc<TokioMutex<Option<XMPPAsyncClient>>>;

/// The client shell: owns the connection slot and routes stanzas into
/// the messaging pipeline. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ChatClient {
    jid: String,
    domain: String,
    slot: ClientSlot,
    connected: Arc<AtomicBool>,
    carbons_enabled: Arc<AtomicBool>,
    db: MessageDb,
    events: EventBus,
    notifications: NotificationContext,
    roster: RosterHandle,
    dispatcher: Dispatcher,
}

/// Wire handoff through the shared connection slot.
struct ClientSink {
    slot: ClientSlot,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl StanzaSink for ClientSink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_stanza(&self, stanza: Element) -> Result<()> {
        let mut guard = self.slot.lock().await;
        match guard.as_mut() {
            Some(client) => client
                .send_stanza(stanza)
                .await
                .map_err(|e| anyhow!("Failed to send stanza: {}", e)),
            None => Err(anyhow!("No active connection")),
        }
    }
}

impl ChatClient {
    pub fn new(
        account_jid: &str,
        db: MessageDb,
        events: EventBus,
        notifications: NotificationContext,
    ) -> Result<Self> {
        let jid = bare_jid(account_jid).to_string();
        let domain = jid
            .split('@')
            .nth(1)
            .filter(|domain| !domain.is_empty())
            .ok_or_else(|| anyhow!("Invalid account JID '{}'", account_jid))?
            .to_string();

        let slot: ClientSlot = Arc::new(TokioMutex::new(None));
        let connected = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(ClientSink {
            slot: slot.clone(),
            connected: connected.clone(),
        });
        let dispatcher = Dispatcher::new(&jid, sink, db.clone(), events.clone());

        Ok(ChatClient {
            jid,
            domain,
            slot,
            connected,
            carbons_enabled: Arc::new(AtomicBool::new(false)),
            db,
            events,
            notifications,
            roster: RosterHandle::new(),
            dispatcher,
        })
    }

    pub fn account_jid(&self) -> &str {
        &self.jid
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn carbons_enabled(&self) -> bool {
        self.carbons_enabled.load(Ordering::SeqCst)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn roster(&self) -> &RosterHandle {
        &self.roster
    }

    pub fn notifications(&self) -> &NotificationContext {
        &self.notifications
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) async fn handle_stanza(&self, stanza: Element) {
        match stanza.name() {
            "message" => self.handle_message_stanza(&stanza).await,
            "iq" => self.handle_iq_stanza(&stanza).await,
            _ => {}
        }
    }

    async fn handle_message_stanza(&self, stanza: &Element) {
        // Carbons are unwrapped and funneled through the same path as
        // direct messages, so nothing downstream special-cases them.
        if let Some((inner, is_sent)) = carbons::unwrap_carbon(stanza, &self.jid) {
            debug!(
                "Processing {} carbon",
                if is_sent { "sent" } else { "received" }
            );
            let inner = inner.clone();
            self.process_chat_message(&inner).await;
            return;
        }

        self.process_chat_message(stanza).await;
    }

    async fn process_chat_message(&self, stanza: &Element) {
        // Delivery receipts are correlated purely by id; an unknown id is
        // a stale signal and dropped inside the store.
        if let Some(receipt_id) = receipts::receipt_id(stanza) {
            if let Err(e) = self
                .db
                .set_delivery_state(&receipt_id, DeliveryState::Delivered, None)
                .await
            {
                warn!("Could not apply receipt for {}: {}", receipt_id, e);
            }
            return;
        }

        match codec::decode_message(stanza, &self.jid) {
            DecodeOutcome::DeliveryError { id, text } => {
                if let Err(e) = self
                    .db
                    .set_delivery_state(&id, DeliveryState::Error, Some(text))
                    .await
                {
                    warn!("Could not record delivery error for {}: {}", id, e);
                }
            }
            DecodeOutcome::Ignored => {}
            DecodeOutcome::Insert(message) => {
                if message.receipt_requested && !message.sent_by_me {
                    if let Some(from) = stanza.attr("from") {
                        let ack = receipts::receipt_ack(from, &message.id);
                        if let Err(e) = self.send_raw(ack).await {
                            debug!("Could not send receipt ack: {}", e);
                        }
                    }
                }

                if let Err(e) = self
                    .db
                    .add_message(message.clone(), MessageOrigin::Received)
                    .await
                {
                    error!("Could not store message {}: {}", message.id, e);
                }
                self.maybe_notify(&message);
            }
            DecodeOutcome::Edit {
                replace_id,
                message,
            } => {
                match self
                    .db
                    .update_message(&replace_id, MessageMutation::ReplaceWith(message.clone()))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!("Correction for unknown message {}", replace_id),
                    Err(e) => error!("Could not apply correction to {}: {}", replace_id, e),
                }
                self.maybe_notify(&message);
            }
        }
    }

    async fn handle_iq_stanza(&self, stanza: &Element) {
        if stanza.attr("type") != Some("result") {
            return;
        }

        if let Some(query) = stanza.get_child("query", custom_ns::DISCO_INFO) {
            // Carbon support is only believed when our own server says
            // so; discovery results from anywhere else are ignored.
            let from = stanza.attr("from").unwrap_or(&self.domain);
            if from != self.domain {
                debug!("Ignoring disco#info result from {}", from);
                return;
            }
            if carbons::offers_carbons(query) && !self.carbons_enabled() {
                info!("Server supports message carbons, enabling");
                match self.send_raw(carbons::carbons_enable_iq()).await {
                    Ok(()) => self.carbons_enabled.store(true, Ordering::SeqCst),
                    Err(e) => warn!("Could not enable message carbons: {}", e),
                }
            }
        } else if let Some(query) = stanza.get_child("query", custom_ns::ROSTER) {
            let count = self.roster.update_from_query(query);
            debug!("Roster synchronized, {} entries", count);
        }
    }

    fn maybe_notify(&self, message: &Message) {
        if !self.notifications.should_notify(message) {
            return;
        }

        // The contact can differ from the sender when the message is a
        // forward of another of the user's own sessions.
        let contact_jid = message.contact_jid().to_string();
        let contact_name = self.roster.display_name(&contact_jid);
        self.events.emit(ClientEvent::ShowMessageNotification {
            contact_jid,
            contact_name,
            body: message.body.clone(),
        });
    }

    /// Housekeeping after the stream comes up: roster, discovery and the
    /// pending replay.
    pub(crate) async fn handle_online(&self) {
        self.connected.store(true, Ordering::SeqCst);

        if let Err(e) = self.send_raw(roster::roster_request_iq()).await {
            warn!("Could not request roster: {}", e);
        }
        if let Err(e) = self.send_raw(self.disco_info_request()).await {
            warn!("Could not query server features: {}", e);
        }
        if let Err(e) = self.dispatcher.replay_pending().await {
            warn!("Could not replay pending messages: {}", e);
        }
    }

    fn disco_info_request(&self) -> Element {
        let query = Element::builder("query", custom_ns::DISCO_INFO).build();
        Element::builder("iq", "jabber:client")
            .attr("type", "get")
            .attr("to", &self.domain)
            .attr("id", &format!("disco_info_{}", Uuid::new_v4()))
            .append(query)
            .build()
    }

    async fn send_raw(&self, stanza: Element) -> Result<()> {
        let mut guard = self.slot.lock().await;
        match guard.as_mut() {
            Some(client) => client
                .send_stanza(stanza)
                .await
                .map_err(|e| anyhow!("Failed to send stanza: {}", e)),
            None => Err(anyhow!("No active connection")),
        }
    }
}
