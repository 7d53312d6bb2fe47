// Outbound message dispatch: wire handoff, failure reporting and the
// pending replay after a reconnect.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use uuid::Uuid;
use xmpp_parsers::Element;

use super::codec;
use crate::events::{ClientEvent, EventBus};
use crate::media;
use crate::models::{DeliveryState, Message, MessageMutation, MessageOrigin};
use crate::storage::MessageDb;

// These texts are stored as error text verbatim and surface unchanged as
// passive notifications, so downstream consumers can match on them.
pub const MESSAGE_SEND_FAILED: &str = "Message could not be sent.";
pub const CORRECTION_NOT_CONNECTED: &str =
    "Could not correct message, as a result of not being connected.";
pub const CORRECTION_FAILED: &str = "Message correction was not successful.";

/// Wire handoff seam. The success of `send_stanza` only means the stanza
/// left this process, not that it was delivered.
#[async_trait]
pub trait StanzaSink: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn send_stanza(&self, stanza: Element) -> Result<()>;
}

/// Serializes composed messages to the wire and keeps their delivery
/// state in step with what actually happened.
#[derive(Clone)]
pub struct Dispatcher {
    account_jid: String,
    sink: Arc<dyn StanzaSink>,
    db: MessageDb,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        account_jid: &str,
        sink: Arc<dyn StanzaSink>,
        db: MessageDb,
        events: EventBus,
    ) -> Self {
        Dispatcher {
            account_jid: account_jid.to_string(),
            sink,
            db,
            events,
        }
    }

    /// Composes and sends a chat message. The message is persisted as
    /// pending first, so a failed or impossible handoff never loses it.
    /// Returns the generated message id.
    pub async fn send_message(
        &self,
        to: &str,
        body: &str,
        is_spoiler: bool,
        spoiler_hint: &str,
    ) -> Result<String> {
        let mut message = Message::new();
        message.id = Uuid::new_v4().to_string();
        message.from = self.account_jid.clone();
        message.to = to.to_string();
        message.sent_by_me = true;
        message.body = body.to_string();
        message.receipt_requested = true;
        message.delivery_state = DeliveryState::Pending;
        message.stamp = Utc::now();

        if is_spoiler {
            message.is_spoiler = true;
            message.spoiler_hint = spoiler_hint.to_string();
        } else if media::is_geo_location(body) {
            // A locally composed location share gets the same media
            // metadata an inbound one would.
            let (media_type, content_type) = media::classify_url(body);
            message.media_type = media_type;
            message.media_content_type = content_type.to_string();
            message.media_location = body.to_string();
            message.out_of_band_url = body.to_string();
        }

        self.db
            .add_message(message.clone(), MessageOrigin::Sent)
            .await?;
        self.send_pending_message(&message).await;
        Ok(message.id)
    }

    /// Attempts the wire handoff for a pending message. When there is no
    /// connection the message simply stays pending for the next replay;
    /// a rejected handoff marks it failed instead.
    pub async fn send_pending_message(&self, message: &Message) {
        if !self.sink.is_connected() {
            return;
        }

        let stanza = match codec::encode_message(message) {
            Ok(stanza) => stanza,
            Err(e) => {
                warn!("Could not encode message {}: {}", message.id, e);
                self.report_send_failure(&message.id).await;
                return;
            }
        };

        match self.sink.send_stanza(stanza.into()).await {
            Ok(()) => {
                if let Err(e) = self
                    .db
                    .set_delivery_state(&message.id, DeliveryState::Sent, None)
                    .await
                {
                    warn!("Could not mark message {} as sent: {}", message.id, e);
                }
            }
            Err(e) => {
                warn!("Could not send message {}: {}", message.id, e);
                self.report_send_failure(&message.id).await;
            }
        }
    }

    /// Sends a correction for an already stored message. The stored
    /// record keeps its id; only its body changes.
    pub async fn correct_message(&self, to: &str, message_id: &str, body: &str) -> Result<()> {
        if !self.sink.is_connected() {
            warn!("Could not correct message {}: not connected", message_id);
            self.events.emit(ClientEvent::PassiveNotification {
                text: CORRECTION_NOT_CONNECTED.to_string(),
            });
            return Ok(());
        }

        let mut correction = Message::new();
        correction.id = Uuid::new_v4().to_string();
        correction.from = self.account_jid.clone();
        correction.to = to.to_string();
        correction.sent_by_me = true;
        correction.body = body.to_string();
        correction.receipt_requested = true;
        correction.is_edited = true;
        correction.replace_id = message_id.to_string();

        self.db
            .update_message(message_id, MessageMutation::CorrectBody(body.to_string()))
            .await?;

        let stanza = codec::encode_message(&correction)?;
        match self.sink.send_stanza(stanza.into()).await {
            Ok(()) => {
                // The correction stanza's own id is never persisted; the
                // state change is keyed on the stored id.
                if let Err(e) = self
                    .db
                    .set_delivery_state(message_id, DeliveryState::Sent, None)
                    .await
                {
                    warn!(
                        "Could not mark corrected message {} as sent: {}",
                        message_id, e
                    );
                }
            }
            Err(e) => {
                warn!("Could not send correction for {}: {}", message_id, e);
                self.events.emit(ClientEvent::PassiveNotification {
                    text: CORRECTION_FAILED.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Replays every message still pending, each attempted exactly once.
    pub async fn replay_pending(&self) -> Result<()> {
        let pending = self.db.fetch_pending_messages(&self.account_jid).await?;
        if pending.is_empty() {
            return Ok(());
        }

        info!("Replaying {} pending messages", pending.len());
        for message in pending {
            self.send_pending_message(&message).await;
        }
        Ok(())
    }

    async fn report_send_failure(&self, id: &str) {
        self.events.emit(ClientEvent::PassiveNotification {
            text: MESSAGE_SEND_FAILED.to_string(),
        });
        if let Err(e) = self
            .db
            .set_delivery_state(id, DeliveryState::Error, Some(MESSAGE_SEND_FAILED.to_string()))
            .await
        {
            warn!("Could not mark message {} as failed: {}", id, e);
        }
    }
}
