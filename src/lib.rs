pub mod config;
pub mod events;
pub mod media;
pub mod models;
pub mod notifications;
pub mod storage;
pub mod utils;
pub mod xmpp;

// Re-export the types most callers need.
pub use events::{ClientEvent, EventBus};
pub use models::{
    DeliveryState, MediaType, Message, MessageFieldPatch, MessageMutation, MessageOrigin,
    RosterEntry,
};
pub use notifications::NotificationContext;
pub use storage::{MessageDb, MessageStore};
pub use xmpp::ChatClient;
