// Roster synchronization. The messaging core treats the roster as an
// external collaborator and only reads display names from it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;
use xmpp_parsers::Element;

use super::custom_ns;
use crate::models::{RosterEntry, Subscription};

/// Shared roster cache.
#[derive(Clone, Default)]
pub struct RosterHandle {
    entries: Arc<Mutex<HashMap<String, RosterEntry>>>,
}

impl RosterHandle {
    pub fn new() -> Self {
        RosterHandle::default()
    }

    /// User-facing name for a JID, falling back to the JID itself.
    pub fn display_name(&self, jid: &str) -> String {
        let entries = self.entries.lock().unwrap();
        match entries.get(jid) {
            Some(entry) if !entry.name.is_empty() => entry.name.clone(),
            _ => jid.to_string(),
        }
    }

    pub fn entries(&self) -> Vec<RosterEntry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    /// Merges a jabber:iq:roster query into the cache. Returns the
    /// number of items parsed.
    pub fn update_from_query(&self, query: &Element) -> usize {
        let mut parsed = 0;
        let mut entries = self.entries.lock().unwrap();
        for item in query.children().filter(|child| child.name() == "item") {
            let jid = match item.attr("jid") {
                Some(jid) if !jid.is_empty() => jid.to_string(),
                _ => continue,
            };
            let entry = RosterEntry {
                name: item.attr("name").unwrap_or_default().to_string(),
                subscription: Subscription::from_attr(
                    item.attr("subscription").unwrap_or_default(),
                ),
                jid: jid.clone(),
            };
            entries.insert(jid, entry);
            parsed += 1;
        }
        parsed
    }
}

pub fn roster_request_iq() -> Element {
    Element::builder("iq", "jabber:client")
        .attr("type", "get")
        .attr("id", &format!("roster_{}", Uuid::new_v4()))
        .append(Element::builder("query", custom_ns::ROSTER).build())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_from_query() {
        let query = Element::builder("query", custom_ns::ROSTER)
            .append(
                Element::builder("item", custom_ns::ROSTER)
                    .attr("jid", "alice@example.org")
                    .attr("name", "Alice")
                    .attr("subscription", "both")
                    .build(),
            )
            .append(
                Element::builder("item", custom_ns::ROSTER)
                    .attr("jid", "bob@example.org")
                    .build(),
            )
            .build();

        let roster = RosterHandle::new();
        assert_eq!(roster.update_from_query(&query), 2);
        assert_eq!(roster.display_name("alice@example.org"), "Alice");
        // No name set: fall back to the JID.
        assert_eq!(roster.display_name("bob@example.org"), "bob@example.org");
        // Unknown JIDs resolve to themselves.
        assert_eq!(roster.display_name("carol@example.org"), "carol@example.org");

        let alice = roster
            .entries()
            .into_iter()
            .find(|entry| entry.jid == "alice@example.org")
            .unwrap();
        assert_eq!(alice.subscription, Subscription::Both);
    }
}
