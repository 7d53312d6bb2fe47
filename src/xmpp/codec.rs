// Conversion between wire stanzas and the canonical Message.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::debug;
use uuid::Uuid;
use xmpp_parsers::message::{Body, Message as MessageStanza, MessageType};
use xmpp_parsers::{Element, Jid};

use super::{bare_jid, custom_ns};
use crate::media;
use crate::models::{DeliveryState, MediaType, Message};

/// Result of decoding an inbound message stanza.
#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    /// A regular message to be inserted into the history.
    Insert(Message),
    /// A correction to be routed as an update against the replaced id.
    Edit { replace_id: String, message: Message },
    /// An error stanza correlated to an earlier outbound message.
    DeliveryError { id: String, text: String },
    /// Nothing worth keeping (empty body, unusable stanza).
    Ignored,
}

/// Decodes a message stanza. Carbon-forwarded messages go through this
/// same path, so carbons need no special casing downstream.
pub fn decode_message(stanza: &Element, account_jid: &str) -> DecodeOutcome {
    if stanza.attr("type") == Some("error") {
        let id = stanza.attr("id").unwrap_or_default();
        if id.is_empty() {
            debug!("Dropping error stanza without id");
            return DecodeOutcome::Ignored;
        }
        return DecodeOutcome::DeliveryError {
            id: id.to_string(),
            text: error_text(stanza),
        };
    }

    let body = match message_body(stanza) {
        Some(body) if !body.is_empty() => body,
        _ => return DecodeOutcome::Ignored,
    };

    let account_bare = bare_jid(account_jid);
    let from = bare_jid(stanza.attr("from").unwrap_or_default()).to_string();
    let to = bare_jid(stanza.attr("to").unwrap_or(account_jid)).to_string();

    let mut message = Message::new();
    message.sent_by_me = from == account_bare;
    message.from = from;
    message.to = to;
    message.body = body;
    // Copies that reached us are final as far as delivery goes.
    message.delivery_state = DeliveryState::Delivered;
    message.receipt_requested = stanza.has_child("request", custom_ns::RECEIPTS);

    if let Some(spoiler) = stanza.get_child("spoiler", custom_ns::SPOILER) {
        message.is_spoiler = true;
        message.spoiler_hint = spoiler.text();
    }

    let out_of_band_url = stanza
        .get_child("x", custom_ns::OOB)
        .and_then(|x| x.get_child("url", custom_ns::OOB))
        .map(|url| url.text())
        .unwrap_or_default();

    if let Some(attachment) = media::detect_attachment(&message.body, &out_of_band_url) {
        if attachment.media_type == MediaType::GeoLocation {
            message.media_location = attachment.url.clone();
        }
        message.media_type = attachment.media_type;
        message.media_content_type = attachment.content_type;
        message.out_of_band_url = attachment.url;
    }

    message.stamp = delay_stamp(stanza).unwrap_or_else(Utc::now);

    let replace_id = stanza
        .get_child("replace", custom_ns::CORRECT)
        .and_then(|replace| replace.attr("id"))
        .unwrap_or_default();

    if replace_id.is_empty() {
        message.id = match stanza.attr("id") {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        DecodeOutcome::Insert(message)
    } else {
        // The correction replaces the old record; it carries no id of its
        // own until the update completes.
        message.is_edited = true;
        message.id.clear();
        DecodeOutcome::Edit {
            replace_id: replace_id.to_string(),
            message,
        }
    }
}

/// Builds the outbound stanza for a message.
pub fn encode_message(message: &Message) -> Result<MessageStanza> {
    let to: Jid = message
        .to
        .parse()
        .map_err(|e| anyhow!("Invalid recipient JID '{}': {}", message.to, e))?;

    let mut stanza = MessageStanza::new(None);
    stanza.to = Some(to);
    stanza.id = Some(message.id.clone());
    stanza.type_ = MessageType::Chat;
    stanza
        .bodies
        .insert(String::new(), Body(message.body.clone()));

    if message.receipt_requested {
        stanza
            .payloads
            .push(Element::builder("request", custom_ns::RECEIPTS).build());
    }

    // Hint the server to archive the message so history stays complete.
    stanza
        .payloads
        .push(Element::builder("store", custom_ns::HINTS).build());

    if message.is_spoiler {
        // Spoilers are not modeled by the protocol library, so the
        // extension element is built by hand.
        let mut spoiler = Element::builder("spoiler", custom_ns::SPOILER).build();
        spoiler.append_text_node(message.spoiler_hint.clone());
        stanza.payloads.push(spoiler);
    }

    if !message.out_of_band_url.is_empty() {
        let mut url = Element::builder("url", custom_ns::OOB).build();
        url.append_text_node(message.out_of_band_url.clone());
        let oob = Element::builder("x", custom_ns::OOB).append(url).build();
        stanza.payloads.push(oob);
    }

    if !message.replace_id.is_empty() {
        stanza.payloads.push(
            Element::builder("replace", custom_ns::CORRECT)
                .attr("id", &message.replace_id)
                .build(),
        );
    }

    Ok(stanza)
}

fn message_body(stanza: &Element) -> Option<String> {
    // The body usually sits in the jabber:client namespace, but be
    // lenient about what servers hand us.
    for child in stanza.children() {
        if child.name() == "body" {
            return Some(child.text());
        }
    }
    None
}

fn error_text(stanza: &Element) -> String {
    for child in stanza.children() {
        if child.name() == "error" {
            for grandchild in child.children() {
                if grandchild.name() == "text" {
                    return grandchild.text();
                }
            }
        }
    }
    String::new()
}

fn delay_stamp(stanza: &Element) -> Option<DateTime<Utc>> {
    let raw = stanza
        .get_child("delay", custom_ns::DELAY)
        .and_then(|delay| delay.attr("stamp"))?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(stamp) => Some(stamp.with_timezone(&Utc)),
        Err(e) => {
            debug!("Ignoring invalid delay stamp '{}': {}", raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ME: &str = "me@example.org";

    fn chat_stanza(from: &str, to: &str, id: &str, body: &str) -> Element {
        let mut body_el = Element::builder("body", "jabber:client").build();
        body_el.append_text_node(body.to_string());
        Element::builder("message", "jabber:client")
            .attr("from", from)
            .attr("to", to)
            .attr("id", id)
            .attr("type", "chat")
            .append(body_el)
            .build()
    }

    #[test]
    fn test_decode_basic_message() {
        let stanza = chat_stanza("alice@example.org/phone", ME, "m1", "hello");
        let message = match decode_message(&stanza, ME) {
            DecodeOutcome::Insert(message) => message,
            other => panic!("expected insert, got {:?}", other),
        };

        assert_eq!(message.id, "m1");
        assert_eq!(message.from, "alice@example.org");
        assert_eq!(message.to, ME);
        assert!(!message.sent_by_me);
        assert_eq!(message.body, "hello");
        assert_eq!(message.media_type, MediaType::Text);
        assert!(!message.is_edited);
    }

    #[test]
    fn test_decode_derives_sent_by_me() {
        let stanza = chat_stanza(&format!("{}/laptop", ME), "alice@example.org", "m2", "hi");
        match decode_message(&stanza, ME) {
            DecodeOutcome::Insert(message) => assert!(message.sent_by_me),
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_drops_empty_body() {
        let stanza = Element::builder("message", "jabber:client")
            .attr("from", "alice@example.org")
            .attr("to", ME)
            .attr("id", "m3")
            .build();
        assert!(matches!(
            decode_message(&stanza, ME),
            DecodeOutcome::Ignored
        ));
    }

    #[test]
    fn test_decode_error_stanza() {
        let mut text = Element::builder("text", custom_ns::STANZAS).build();
        text.append_text_node("Recipient unavailable".to_string());
        let error = Element::builder("error", "jabber:client")
            .attr("type", "cancel")
            .append(text)
            .build();
        let stanza = Element::builder("message", "jabber:client")
            .attr("from", "alice@example.org")
            .attr("id", "m4")
            .attr("type", "error")
            .append(error)
            .build();

        match decode_message(&stanza, ME) {
            DecodeOutcome::DeliveryError { id, text } => {
                assert_eq!(id, "m4");
                assert_eq!(text, "Recipient unavailable");
            }
            other => panic!("expected delivery error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_generates_missing_id() {
        let mut body_el = Element::builder("body", "jabber:client").build();
        body_el.append_text_node("no id".to_string());
        let stanza = Element::builder("message", "jabber:client")
            .attr("from", "alice@example.org")
            .attr("to", ME)
            .append(body_el)
            .build();

        match decode_message(&stanza, ME) {
            DecodeOutcome::Insert(message) => assert!(!message.id.is_empty()),
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_valid_delay_stamp() {
        let delay = Element::builder("delay", custom_ns::DELAY)
            .attr("stamp", "2023-04-05T06:07:08Z")
            .build();
        let mut stanza = chat_stanza("alice@example.org", ME, "m5", "late");
        stanza.append_child(delay);

        match decode_message(&stanza, ME) {
            DecodeOutcome::Insert(message) => {
                let expected = Utc.with_ymd_and_hms(2023, 4, 5, 6, 7, 8).unwrap();
                assert_eq!(message.stamp, expected);
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_invalid_delay_stamp_falls_back_to_now() {
        let delay = Element::builder("delay", custom_ns::DELAY)
            .attr("stamp", "2023-13-45T99:99:99Z")
            .build();
        let mut stanza = chat_stanza("alice@example.org", ME, "m6", "late");
        stanza.append_child(delay);

        let before = Utc::now();
        match decode_message(&stanza, ME) {
            DecodeOutcome::Insert(message) => {
                assert!(message.stamp >= before);
                assert!(message.stamp <= Utc::now());
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_spoiler() {
        let mut spoiler = Element::builder("spoiler", custom_ns::SPOILER).build();
        spoiler.append_text_node("Season finale".to_string());
        let mut stanza = chat_stanza("alice@example.org", ME, "m7", "they all live");
        stanza.append_child(spoiler);

        match decode_message(&stanza, ME) {
            DecodeOutcome::Insert(message) => {
                assert!(message.is_spoiler);
                assert_eq!(message.spoiler_hint, "Season finale");
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_correction_routes_as_edit() {
        let replace = Element::builder("replace", custom_ns::CORRECT)
            .attr("id", "m1")
            .build();
        let mut stanza = chat_stanza("alice@example.org", ME, "m8", "hello, fixed");
        stanza.append_child(replace);

        match decode_message(&stanza, ME) {
            DecodeOutcome::Edit {
                replace_id,
                message,
            } => {
                assert_eq!(replace_id, "m1");
                assert!(message.is_edited);
                assert!(message.id.is_empty());
                assert_eq!(message.body, "hello, fixed");
            }
            other => panic!("expected edit, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_carries_extensions() {
        let mut message = Message::new();
        message.id = "out1".to_string();
        message.to = "alice@example.org".to_string();
        message.body = "psst".to_string();
        message.receipt_requested = true;
        message.is_spoiler = true;
        message.spoiler_hint = "surprise".to_string();

        let stanza = encode_message(&message).unwrap();
        assert_eq!(stanza.id.as_deref(), Some("out1"));
        assert!(stanza
            .payloads
            .iter()
            .any(|p| p.name() == "request" && p.ns() == custom_ns::RECEIPTS));
        assert!(stanza
            .payloads
            .iter()
            .any(|p| p.name() == "store" && p.ns() == custom_ns::HINTS));
        let spoiler = stanza
            .payloads
            .iter()
            .find(|p| p.name() == "spoiler" && p.ns() == custom_ns::SPOILER)
            .expect("spoiler element");
        assert_eq!(spoiler.text(), "surprise");
    }

    #[test]
    fn test_encode_correction_carries_replace() {
        let mut message = Message::new();
        message.id = "out2".to_string();
        message.to = "alice@example.org".to_string();
        message.body = "better wording".to_string();
        message.replace_id = "out1".to_string();

        let stanza = encode_message(&message).unwrap();
        let replace = stanza
            .payloads
            .iter()
            .find(|p| p.name() == "replace" && p.ns() == custom_ns::CORRECT)
            .expect("replace element");
        assert_eq!(replace.attr("id"), Some("out1"));
    }

    #[test]
    fn test_encode_rejects_invalid_recipient() {
        let mut message = Message::new();
        message.id = "out3".to_string();
        message.to = String::new();
        message.body = "nowhere".to_string();
        assert!(encode_message(&message).is_err());
    }
}
