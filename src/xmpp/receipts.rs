// Message Delivery Receipts: acknowledgments correlated purely by
// message id.

use uuid::Uuid;
use xmpp_parsers::Element;

use super::custom_ns;

/// The acknowledged message id, if this stanza is a delivery receipt.
pub fn receipt_id(stanza: &Element) -> Option<String> {
    stanza
        .get_child("received", custom_ns::RECEIPTS)
        .and_then(|received| received.attr("id"))
        .map(|id| id.to_string())
}

/// Builds the acknowledgment for a received message that requested a
/// receipt.
pub fn receipt_ack(to: &str, message_id: &str) -> Element {
    Element::builder("message", "jabber:client")
        .attr("to", to)
        .attr("id", &Uuid::new_v4().to_string())
        .append(
            Element::builder("received", custom_ns::RECEIPTS)
                .attr("id", message_id)
                .build(),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_id_extraction() {
        let stanza = Element::builder("message", "jabber:client")
            .attr("from", "alice@example.org")
            .append(
                Element::builder("received", custom_ns::RECEIPTS)
                    .attr("id", "m42")
                    .build(),
            )
            .build();
        assert_eq!(receipt_id(&stanza).as_deref(), Some("m42"));

        let plain = Element::builder("message", "jabber:client").build();
        assert_eq!(receipt_id(&plain), None);
    }

    #[test]
    fn test_ack_shape() {
        let ack = receipt_ack("alice@example.org/phone", "m42");
        assert_eq!(ack.attr("to"), Some("alice@example.org/phone"));
        let received = ack
            .get_child("received", custom_ns::RECEIPTS)
            .expect("received element");
        assert_eq!(received.attr("id"), Some("m42"));
    }
}
