// Message Carbons: copies of messages sent or received by other
// sessions of the same account, mirrored to this one.

use log::warn;
use uuid::Uuid;
use xmpp_parsers::Element;

use super::{bare_jid, custom_ns};

/// Unwraps a carbon copy down to the forwarded message element. Returns
/// the inner message and whether it was a "sent" carbon (a message our
/// account sent from another session).
///
/// Carbons are only ever legitimate from our own account; a wrapper with
/// any other origin could inject messages into foreign conversations and
/// is discarded.
pub fn unwrap_carbon<'a>(
    stanza: &'a Element,
    account_jid: &str,
) -> Option<(&'a Element, bool)> {
    let (wrapper, is_sent) = if let Some(sent) = stanza.get_child("sent", custom_ns::CARBONS) {
        (sent, true)
    } else if let Some(received) = stanza.get_child("received", custom_ns::CARBONS) {
        (received, false)
    } else {
        return None;
    };

    let outer_from = stanza.attr("from").map(bare_jid).unwrap_or_default();
    if !outer_from.is_empty() && outer_from != bare_jid(account_jid) {
        warn!("Discarding carbon with foreign origin {}", outer_from);
        return None;
    }

    let forwarded = wrapper.get_child("forwarded", custom_ns::FORWARD)?;
    let inner = forwarded.get_child("message", "jabber:client")?;
    Some((inner, is_sent))
}

/// The IQ that asks the server to start mirroring carbons to this
/// session.
pub fn carbons_enable_iq() -> Element {
    let enable = Element::builder("enable", custom_ns::CARBONS).build();
    Element::builder("iq", "jabber:client")
        .attr("type", "set")
        .attr("id", &format!("carbons_{}", Uuid::new_v4()))
        .append(enable)
        .build()
}

/// Whether a disco#info query result advertises carbon support.
pub fn offers_carbons(query: &Element) -> bool {
    query
        .children()
        .any(|child| child.name() == "feature" && child.attr("var") == Some(custom_ns::CARBONS))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: &str = "me@example.org";

    fn carbon_stanza(kind: &str, outer_from: &str) -> Element {
        let mut body = Element::builder("body", "jabber:client").build();
        body.append_text_node("mirrored".to_string());
        let inner = Element::builder("message", "jabber:client")
            .attr("from", format!("{}/desktop", ME))
            .attr("to", "alice@example.org")
            .attr("id", "c1")
            .append(body)
            .build();
        let forwarded = Element::builder("forwarded", custom_ns::FORWARD)
            .append(inner)
            .build();
        let wrapper = Element::builder(kind, custom_ns::CARBONS)
            .append(forwarded)
            .build();
        Element::builder("message", "jabber:client")
            .attr("from", outer_from)
            .attr("to", format!("{}/phone", ME))
            .append(wrapper)
            .build()
    }

    #[test]
    fn test_unwraps_sent_and_received_carbons() {
        let sent_stanza = carbon_stanza("sent", ME);
        let (inner, is_sent) = unwrap_carbon(&sent_stanza, ME).unwrap();
        assert!(is_sent);
        assert_eq!(inner.attr("id"), Some("c1"));

        let (_, is_sent) = unwrap_carbon(&carbon_stanza("received", ME), ME).unwrap();
        assert!(!is_sent);
    }

    #[test]
    fn test_rejects_forged_carbon() {
        let forged = carbon_stanza("sent", "mallory@evil.example");
        assert!(unwrap_carbon(&forged, ME).is_none());
    }

    #[test]
    fn test_plain_message_is_not_a_carbon() {
        let plain = Element::builder("message", "jabber:client")
            .attr("from", "alice@example.org")
            .build();
        assert!(unwrap_carbon(&plain, ME).is_none());
    }

    #[test]
    fn test_feature_probe() {
        let query = Element::builder("query", "http://jabber.org/protocol/disco#info")
            .append(
                Element::builder("feature", "")
                    .attr("var", custom_ns::CARBONS)
                    .build(),
            )
            .build();
        assert!(offers_carbons(&query));

        let without = Element::builder("query", "http://jabber.org/protocol/disco#info")
            .append(
                Element::builder("feature", "")
                    .attr("var", "urn:xmpp:mam:2")
                    .build(),
            )
            .build();
        assert!(!offers_carbons(&without));
    }
}
