// Decides whether an inbound message warrants a user-visible alert.
//
// The mute list, active chat and window focus are owned by UI-facing
// code; this side only reads a snapshot at decision time and performs
// no mutation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::models::Message;

#[derive(Default)]
struct ContextState {
    muted: HashSet<String>,
    active_chat: Option<String>,
    window_focused: bool,
}

/// Shared snapshot of the notification-relevant UI state.
#[derive(Clone, Default)]
pub struct NotificationContext {
    state: Arc<Mutex<ContextState>>,
}

impl NotificationContext {
    pub fn new() -> Self {
        NotificationContext::default()
    }

    pub fn set_muted(&self, jid: &str, muted: bool) {
        let mut state = self.state.lock().unwrap();
        if muted {
            state.muted.insert(jid.to_string());
        } else {
            state.muted.remove(jid);
        }
    }

    pub fn is_muted(&self, jid: &str) -> bool {
        self.state.lock().unwrap().muted.contains(jid)
    }

    pub fn set_active_chat(&self, jid: Option<&str>) {
        self.state.lock().unwrap().active_chat = jid.map(|jid| jid.to_string());
    }

    pub fn active_chat(&self) -> Option<String> {
        self.state.lock().unwrap().active_chat.clone()
    }

    pub fn set_window_focused(&self, focused: bool) {
        self.state.lock().unwrap().window_focused = focused;
    }

    /// A notification fires only when all of these hold:
    ///  * the message was not sent by the user from another resource,
    ///  * notifications from the chat partner are not muted,
    ///  * the corresponding chat is not open while the window is focused.
    pub fn should_notify(&self, message: &Message) -> bool {
        if message.sent_by_me {
            return false;
        }

        let state = self.state.lock().unwrap();
        if state.muted.contains(message.contact_jid()) {
            return false;
        }

        state.active_chat.as_deref() != Some(message.from.as_str()) || !state.window_focused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound_from(jid: &str) -> Message {
        let mut msg = Message::new();
        msg.from = jid.to_string();
        msg.to = "me@example.org".to_string();
        msg.sent_by_me = false;
        msg.body = "hi".to_string();
        msg
    }

    #[test]
    fn test_own_messages_never_notify() {
        let ctx = NotificationContext::new();
        let mut msg = inbound_from("me@example.org");
        msg.to = "alice@example.org".to_string();
        msg.sent_by_me = true;
        assert!(!ctx.should_notify(&msg));
    }

    #[test]
    fn test_muted_contact_never_notifies() {
        let ctx = NotificationContext::new();
        ctx.set_muted("alice@example.org", true);
        assert!(!ctx.should_notify(&inbound_from("alice@example.org")));

        ctx.set_muted("alice@example.org", false);
        assert!(ctx.should_notify(&inbound_from("alice@example.org")));
    }

    #[test]
    fn test_open_focused_chat_suppresses() {
        let ctx = NotificationContext::new();
        ctx.set_active_chat(Some("alice@example.org"));
        ctx.set_window_focused(true);
        assert!(!ctx.should_notify(&inbound_from("alice@example.org")));

        // Unfocused window: notify even for the open chat.
        ctx.set_window_focused(false);
        assert!(ctx.should_notify(&inbound_from("alice@example.org")));

        // Focused window but a different chat open: notify.
        ctx.set_window_focused(true);
        ctx.set_active_chat(Some("bob@example.org"));
        assert!(ctx.should_notify(&inbound_from("alice@example.org")));
    }
}
