use chrono::{DateTime, Utc};

/// A roster contact. The messaging core only consumes these to resolve
/// display names for notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub jid: String,
    pub name: String,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    None,
    To,
    From,
    Both,
}

impl Subscription {
    pub fn from_attr(value: &str) -> Self {
        match value {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            _ => Subscription::None,
        }
    }
}

/// Kind of media a message carries, derived from the first recognized
/// link. The out-of-band URL is checked before any body token, see
/// `media::detect_attachment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Text = 0,
    Image = 1,
    Audio = 2,
    Video = 3,
    Document = 4,
    File = 5,
    GeoLocation = 6,
    Unknown = 7,
}

impl MediaType {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> MediaType {
        match value {
            0 => MediaType::Text,
            1 => MediaType::Image,
            2 => MediaType::Audio,
            3 => MediaType::Video,
            4 => MediaType::Document,
            5 => MediaType::File,
            6 => MediaType::GeoLocation,
            _ => MediaType::Unknown,
        }
    }
}

/// Per-message delivery lifecycle.
///
/// Pending -> Sent -> Delivered, with Error reachable from Pending or
/// Sent. Delivered and Error are terminal. A duplicate same-state signal
/// is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending = 0,
    Sent = 1,
    Delivered = 2,
    Error = 3,
}

impl DeliveryState {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> DeliveryState {
        match value {
            1 => DeliveryState::Sent,
            2 => DeliveryState::Delivered,
            3 => DeliveryState::Error,
            _ => DeliveryState::Pending,
        }
    }

    /// Whether a state change to `next` is allowed. The storage layer
    /// enforces this on every patch; disallowed changes are dropped
    /// silently (stale or duplicate signals, not errors).
    pub fn can_advance_to(self, next: DeliveryState) -> bool {
        match self {
            DeliveryState::Delivered | DeliveryState::Error => false,
            DeliveryState::Pending => next != DeliveryState::Pending,
            DeliveryState::Sent => {
                matches!(next, DeliveryState::Delivered | DeliveryState::Error)
            }
        }
    }
}

/// Where an inserted message came from. Carried on every insert and
/// surfaced in the message-added event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Composed on this session.
    Sent,
    /// Received live from the wire, directly or via carbon.
    Received,
    /// Loaded back from storage.
    Replayed,
}

/// The canonical chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Stanza id, or a locally generated one. Unique within the account's
    /// history; empty only while an edit is in flight.
    pub id: String,
    pub from: String,
    pub to: String,
    /// Derived from comparing `from` to the account's bare JID, never set
    /// independently.
    pub sent_by_me: bool,
    pub body: String,
    pub media_type: MediaType,
    pub media_content_type: String,
    pub media_location: String,
    pub out_of_band_url: String,
    pub is_spoiler: bool,
    pub spoiler_hint: String,
    pub stamp: DateTime<Utc>,
    pub is_edited: bool,
    /// Id of the message this one supersedes; empty unless the message is
    /// an in-flight correction.
    pub replace_id: String,
    pub delivery_state: DeliveryState,
    /// Only meaningful in the Error state.
    pub error_text: String,
    pub receipt_requested: bool,
}

impl Message {
    pub fn new() -> Self {
        Message {
            id: String::new(),
            from: String::new(),
            to: String::new(),
            sent_by_me: false,
            body: String::new(),
            media_type: MediaType::Text,
            media_content_type: String::new(),
            media_location: String::new(),
            out_of_band_url: String::new(),
            is_spoiler: false,
            spoiler_hint: String::new(),
            stamp: Utc::now(),
            is_edited: false,
            replace_id: String::new(),
            delivery_state: DeliveryState::Pending,
            error_text: String::new(),
            receipt_requested: false,
        }
    }

    /// The other party of the conversation this message belongs to. For a
    /// message sent by us (directly or mirrored back via carbon) that is
    /// the recipient, otherwise the sender.
    pub fn contact_jid(&self) -> &str {
        if self.sent_by_me {
            &self.to
        } else {
            &self.from
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Message::new()
    }
}

/// Supported shapes of an update-by-id. The storage worker applies these
/// itself instead of running caller-supplied code.
#[derive(Debug, Clone)]
pub enum MessageMutation {
    /// Full edit replacement from an inbound correction. The stored
    /// record keeps its own id and delivery state, takes everything else
    /// from the new message, gets the edited flag set and the replace id
    /// cleared.
    ReplaceWith(Message),
    /// Local correction: body replaced, edited flag set, replace id
    /// cleared.
    CorrectBody(String),
}

/// Direct field patch, applied as a single UPDATE without loading the
/// record first. Used for the high-frequency delivery updates.
#[derive(Debug, Clone, Default)]
pub struct MessageFieldPatch {
    pub delivery_state: Option<DeliveryState>,
    pub error_text: Option<String>,
}

impl MessageFieldPatch {
    pub fn delivery(state: DeliveryState) -> Self {
        MessageFieldPatch {
            delivery_state: Some(state),
            error_text: None,
        }
    }

    pub fn delivery_error(text: impl Into<String>) -> Self {
        MessageFieldPatch {
            delivery_state: Some(DeliveryState::Error),
            error_text: Some(text.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_state_advances_forward() {
        assert!(DeliveryState::Pending.can_advance_to(DeliveryState::Sent));
        assert!(DeliveryState::Pending.can_advance_to(DeliveryState::Delivered));
        assert!(DeliveryState::Pending.can_advance_to(DeliveryState::Error));
        assert!(DeliveryState::Sent.can_advance_to(DeliveryState::Delivered));
        assert!(DeliveryState::Sent.can_advance_to(DeliveryState::Error));
    }

    #[test]
    fn test_delivery_state_never_regresses() {
        assert!(!DeliveryState::Sent.can_advance_to(DeliveryState::Pending));
        assert!(!DeliveryState::Delivered.can_advance_to(DeliveryState::Pending));
        assert!(!DeliveryState::Delivered.can_advance_to(DeliveryState::Sent));
        assert!(!DeliveryState::Delivered.can_advance_to(DeliveryState::Error));
        assert!(!DeliveryState::Error.can_advance_to(DeliveryState::Sent));
        assert!(!DeliveryState::Error.can_advance_to(DeliveryState::Delivered));
    }

    #[test]
    fn test_delivery_state_duplicate_signal_is_noop() {
        assert!(!DeliveryState::Pending.can_advance_to(DeliveryState::Pending));
        assert!(!DeliveryState::Sent.can_advance_to(DeliveryState::Sent));
        assert!(!DeliveryState::Delivered.can_advance_to(DeliveryState::Delivered));
        assert!(!DeliveryState::Error.can_advance_to(DeliveryState::Error));
    }

    #[test]
    fn test_contact_jid_follows_direction() {
        let mut msg = Message::new();
        msg.from = "alice@example.org".to_string();
        msg.to = "bob@example.org".to_string();

        msg.sent_by_me = false;
        assert_eq!(msg.contact_jid(), "alice@example.org");

        msg.sent_by_me = true;
        assert_eq!(msg.contact_jid(), "bob@example.org");
    }

    #[test]
    fn test_enum_round_trips() {
        for state in [
            DeliveryState::Pending,
            DeliveryState::Sent,
            DeliveryState::Delivered,
            DeliveryState::Error,
        ] {
            assert_eq!(DeliveryState::from_i64(state.as_i64()), state);
        }
        for media in [
            MediaType::Text,
            MediaType::Image,
            MediaType::Audio,
            MediaType::Video,
            MediaType::Document,
            MediaType::File,
            MediaType::GeoLocation,
            MediaType::Unknown,
        ] {
            assert_eq!(MediaType::from_i64(media.as_i64()), media);
        }
    }
}
