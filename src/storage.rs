//! Message history storage.
//!
//! A [`MessageStore`] wraps the SQLite table itself; a [`MessageDb`] is
//! the async handle the rest of the pipeline talks to. One worker owns
//! the connection and drains a single request queue, so all writes are
//! applied in issuance order: an insert followed by an update for the
//! same id always observes the insert first.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};

use crate::events::{ClientEvent, EventBus};
use crate::models::{
    DeliveryState, MediaType, Message, MessageFieldPatch, MessageMutation, MessageOrigin,
};

/// Number of messages returned per history page.
pub const MESSAGE_PAGE_SIZE: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("message store worker is gone")]
    WorkerGone,
}

const MESSAGE_COLUMNS: &str = "id, sender, recipient, sent_by_me, body, media_type, \
     media_content_type, media_location, out_of_band_url, is_spoiler, spoiler_hint, \
     stamp, is_edited, replace_id, delivery_state, error_text, receipt_requested";

/// Synchronous store over a single SQLite connection.
pub struct MessageStore {
    conn: Connection,
}

impl MessageStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create database directory {}: {}", parent.display(), e);
                }
            }
        }
        let conn = Connection::open(path)?;
        let store = MessageStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = MessageStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                sent_by_me INTEGER NOT NULL,
                body TEXT NOT NULL,
                media_type INTEGER NOT NULL,
                media_content_type TEXT NOT NULL,
                media_location TEXT NOT NULL,
                out_of_band_url TEXT NOT NULL,
                is_spoiler INTEGER NOT NULL,
                spoiler_hint TEXT NOT NULL,
                stamp TEXT NOT NULL,
                is_edited INTEGER NOT NULL,
                replace_id TEXT NOT NULL,
                delivery_state INTEGER NOT NULL,
                error_text TEXT NOT NULL,
                receipt_requested INTEGER NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_id ON messages (id)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_parties ON messages (sender, recipient)",
            [],
        )?;

        Ok(())
    }

    /// Checks whether a message with this id already exists in the same
    /// conversation.
    fn message_exists(&self, message: &Message) -> rusqlite::Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE id = ?1
               AND ((sender = ?2 AND recipient = ?3) OR (sender = ?3 AND recipient = ?2))",
            params![message.id, message.from, message.to],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Adds a message. Returns false when a message with the same id
    /// already exists in the same conversation (duplicate suppressed).
    pub fn add_message(&self, message: &Message) -> rusqlite::Result<bool> {
        if self.message_exists(message)? {
            return Ok(false);
        }

        self.conn.execute(
            &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES \
                (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"),
            params![
                message.id,
                message.from,
                message.to,
                message.sent_by_me,
                message.body,
                message.media_type.as_i64(),
                message.media_content_type,
                message.media_location,
                message.out_of_band_url,
                message.is_spoiler,
                message.spoiler_hint,
                encode_stamp(&message.stamp),
                message.is_edited,
                message.replace_id,
                message.delivery_state.as_i64(),
                message.error_text,
                message.receipt_requested,
            ],
        )?;
        Ok(true)
    }

    pub fn load_message(&self, id: &str) -> rusqlite::Result<Option<Message>> {
        self.conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 LIMIT 1"),
                params![id],
                row_to_message,
            )
            .optional()
    }

    /// Loads the message, applies the mutation and writes it back.
    /// Returns false when the id is unknown.
    pub fn update_message(
        &self,
        id: &str,
        mutation: &MessageMutation,
    ) -> rusqlite::Result<bool> {
        let mut message = match self.load_message(id)? {
            Some(message) => message,
            None => return Ok(false),
        };

        match mutation {
            MessageMutation::ReplaceWith(new_message) => {
                // The record keeps its identity and delivery progress; the
                // edit supplies the content.
                let kept_id = message.id.clone();
                let kept_state = message.delivery_state;
                let kept_error = message.error_text.clone();
                message = new_message.clone();
                message.id = kept_id;
                message.delivery_state = kept_state;
                message.error_text = kept_error;
            }
            MessageMutation::CorrectBody(body) => {
                message.body = body.clone();
            }
        }
        message.is_edited = true;
        message.replace_id.clear();

        self.write_message(&message)?;
        Ok(true)
    }

    /// Applies a field patch as a direct UPDATE. Returns the new delivery
    /// state if one was applied; unknown ids and disallowed state changes
    /// come back as None.
    pub fn apply_field_patch(
        &self,
        id: &str,
        patch: &MessageFieldPatch,
    ) -> rusqlite::Result<Option<DeliveryState>> {
        let current: Option<i64> = self
            .conn
            .query_row(
                "SELECT delivery_state FROM messages WHERE id = ?1 LIMIT 1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let current = match current {
            Some(value) => DeliveryState::from_i64(value),
            None => return Ok(None),
        };

        let next = match patch.delivery_state {
            Some(next) => next,
            None => {
                if let Some(text) = &patch.error_text {
                    self.conn.execute(
                        "UPDATE messages SET error_text = ?2 WHERE id = ?1",
                        params![id, text],
                    )?;
                }
                return Ok(None);
            }
        };

        if !current.can_advance_to(next) {
            return Ok(None);
        }

        let error_text = patch.error_text.clone().unwrap_or_default();
        self.conn.execute(
            "UPDATE messages SET delivery_state = ?2, error_text = ?3 WHERE id = ?1",
            params![id, next.as_i64(), error_text],
        )?;
        Ok(Some(next))
    }

    /// A page of history for the conversation between the two JIDs,
    /// newest first, for backward pagination. `skip` offsets the window.
    pub fn fetch_messages(
        &self,
        user1: &str,
        user2: &str,
        skip: u32,
    ) -> rusqlite::Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (sender = ?1 AND recipient = ?2) OR (sender = ?2 AND recipient = ?1)
             ORDER BY stamp DESC LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![user1, user2, MESSAGE_PAGE_SIZE, skip],
            row_to_message,
        )?;
        rows.collect()
    }

    /// All messages involving `jid` that are still pending, oldest first
    /// (the order they are replayed in).
    pub fn fetch_pending_messages(&self, jid: &str) -> rusqlite::Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE delivery_state = ?1 AND (sender = ?2 OR recipient = ?2)
             ORDER BY stamp ASC"
        ))?;
        let rows = stmt.query_map(
            params![DeliveryState::Pending.as_i64(), jid],
            row_to_message,
        )?;
        rows.collect()
    }

    /// Stamp of the newest stored message, if any.
    pub fn fetch_last_message_stamp(&self) -> rusqlite::Result<Option<DateTime<Utc>>> {
        let stamp: Option<String> = self
            .conn
            .query_row(
                "SELECT stamp FROM messages ORDER BY stamp DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match stamp {
            Some(raw) => decode_stamp(&raw, 0).map(Some),
            None => Ok(None),
        }
    }

    /// Removes all messages of an account, optionally narrowed to one
    /// conversation. Irreversible.
    pub fn remove_messages(
        &self,
        account_jid: &str,
        chat_jid: Option<&str>,
    ) -> rusqlite::Result<()> {
        match chat_jid {
            Some(chat) => {
                self.conn.execute(
                    "DELETE FROM messages
                     WHERE (sender = ?1 OR recipient = ?1)
                       AND (sender = ?2 OR recipient = ?2)",
                    params![account_jid, chat],
                )?;
            }
            None => {
                self.conn.execute(
                    "DELETE FROM messages WHERE sender = ?1 OR recipient = ?1",
                    params![account_jid],
                )?;
            }
        }
        Ok(())
    }

    fn write_message(&self, message: &Message) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE messages SET
                sender = ?2, recipient = ?3, sent_by_me = ?4, body = ?5,
                media_type = ?6, media_content_type = ?7, media_location = ?8,
                out_of_band_url = ?9, is_spoiler = ?10, spoiler_hint = ?11,
                stamp = ?12, is_edited = ?13, replace_id = ?14,
                delivery_state = ?15, error_text = ?16, receipt_requested = ?17
             WHERE id = ?1",
            params![
                message.id,
                message.from,
                message.to,
                message.sent_by_me,
                message.body,
                message.media_type.as_i64(),
                message.media_content_type,
                message.media_location,
                message.out_of_band_url,
                message.is_spoiler,
                message.spoiler_hint,
                encode_stamp(&message.stamp),
                message.is_edited,
                message.replace_id,
                message.delivery_state.as_i64(),
                message.error_text,
                message.receipt_requested,
            ],
        )?;
        Ok(())
    }
}

fn encode_stamp(stamp: &DateTime<Utc>) -> String {
    // Fixed-width RFC 3339 so lexicographic and chronological order
    // agree in the ORDER BY clauses.
    stamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_stamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(stamp) => Ok(stamp.with_timezone(&Utc)),
        Err(e) => Err(rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(e),
        )),
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let media_type: i64 = row.get(5)?;
    let stamp_raw: String = row.get(11)?;
    let delivery_state: i64 = row.get(14)?;

    Ok(Message {
        id: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        sent_by_me: row.get(3)?,
        body: row.get(4)?,
        media_type: MediaType::from_i64(media_type),
        media_content_type: row.get(6)?,
        media_location: row.get(7)?,
        out_of_band_url: row.get(8)?,
        is_spoiler: row.get(9)?,
        spoiler_hint: row.get(10)?,
        stamp: decode_stamp(&stamp_raw, 11)?,
        is_edited: row.get(12)?,
        replace_id: row.get(13)?,
        delivery_state: DeliveryState::from_i64(delivery_state),
        error_text: row.get(15)?,
        receipt_requested: row.get(16)?,
    })
}

enum StoreRequest {
    Add {
        message: Message,
        origin: MessageOrigin,
        respond: oneshot::Sender<Result<bool, StorageError>>,
    },
    Update {
        id: String,
        mutation: MessageMutation,
        respond: oneshot::Sender<Result<bool, StorageError>>,
    },
    Patch {
        id: String,
        patch: MessageFieldPatch,
        respond: oneshot::Sender<Result<bool, StorageError>>,
    },
    FetchPage {
        user1: String,
        user2: String,
        skip: u32,
        respond: oneshot::Sender<Result<Vec<Message>, StorageError>>,
    },
    FetchPending {
        jid: String,
        respond: oneshot::Sender<Result<Vec<Message>, StorageError>>,
    },
    FetchLastStamp {
        respond: oneshot::Sender<Result<Option<DateTime<Utc>>, StorageError>>,
    },
    RemoveAll {
        account_jid: String,
        chat_jid: Option<String>,
        respond: oneshot::Sender<Result<(), StorageError>>,
    },
}

/// Async handle to the message store. Cheap to clone; all clones feed
/// the same worker queue.
#[derive(Clone)]
pub struct MessageDb {
    tx: mpsc::Sender<StoreRequest>,
}

impl MessageDb {
    pub fn open(path: PathBuf, events: EventBus) -> Result<Self, StorageError> {
        let store = MessageStore::open(&path)?;
        Ok(Self::spawn(store, events))
    }

    pub fn open_in_memory(events: EventBus) -> Result<Self, StorageError> {
        let store = MessageStore::open_in_memory()?;
        Ok(Self::spawn(store, events))
    }

    fn spawn(store: MessageStore, events: EventBus) -> Self {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::task::spawn_blocking(move || {
            while let Some(request) = rx.blocking_recv() {
                handle_request(&store, &events, request);
            }
            debug!("message store worker stopped");
        });
        MessageDb { tx }
    }

    /// Adds a message to the history. Returns false when a message with
    /// the same id already exists in the same conversation.
    pub async fn add_message(
        &self,
        message: Message,
        origin: MessageOrigin,
    ) -> Result<bool, StorageError> {
        self.request(|respond| StoreRequest::Add {
            message,
            origin,
            respond,
        })
        .await
    }

    /// Loads a message by id, applies the mutation and writes it back.
    /// Returns false when the id is unknown.
    pub async fn update_message(
        &self,
        id: &str,
        mutation: MessageMutation,
    ) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.request(|respond| StoreRequest::Update {
            id,
            mutation,
            respond,
        })
        .await
    }

    /// Applies a field patch without a full load/store round trip.
    /// Returns true when a delivery state change was applied.
    pub async fn update_message_fields(
        &self,
        id: &str,
        patch: MessageFieldPatch,
    ) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.request(|respond| StoreRequest::Patch { id, patch, respond })
            .await
    }

    pub async fn set_delivery_state(
        &self,
        id: &str,
        state: DeliveryState,
        error_text: Option<String>,
    ) -> Result<bool, StorageError> {
        let patch = MessageFieldPatch {
            delivery_state: Some(state),
            error_text,
        };
        self.update_message_fields(id, patch).await
    }

    pub async fn fetch_messages(
        &self,
        user1: &str,
        user2: &str,
        skip: u32,
    ) -> Result<Vec<Message>, StorageError> {
        let user1 = user1.to_string();
        let user2 = user2.to_string();
        self.request(|respond| StoreRequest::FetchPage {
            user1,
            user2,
            skip,
            respond,
        })
        .await
    }

    pub async fn fetch_pending_messages(
        &self,
        jid: &str,
    ) -> Result<Vec<Message>, StorageError> {
        let jid = jid.to_string();
        self.request(|respond| StoreRequest::FetchPending { jid, respond })
            .await
    }

    pub async fn fetch_last_message_stamp(
        &self,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.request(|respond| StoreRequest::FetchLastStamp { respond })
            .await
    }

    pub async fn remove_messages(
        &self,
        account_jid: &str,
        chat_jid: Option<&str>,
    ) -> Result<(), StorageError> {
        let account_jid = account_jid.to_string();
        let chat_jid = chat_jid.map(|jid| jid.to_string());
        self.request(|respond| StoreRequest::RemoveAll {
            account_jid,
            chat_jid,
            respond,
        })
        .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, StorageError>>) -> StoreRequest,
    ) -> Result<T, StorageError> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(build(respond))
            .await
            .map_err(|_| StorageError::WorkerGone)?;
        rx.await.map_err(|_| StorageError::WorkerGone)?
    }
}

fn handle_request(store: &MessageStore, events: &EventBus, request: StoreRequest) {
    match request {
        StoreRequest::Add {
            message,
            origin,
            respond,
        } => {
            let result = store.add_message(&message);
            match &result {
                Ok(true) => {
                    events.emit(ClientEvent::MessageAdded { message, origin });
                }
                Ok(false) => {
                    debug!("Suppressed duplicate message {}", message.id);
                }
                Err(e) => error!("Failed to store message {}: {}", message.id, e),
            }
            let _ = respond.send(result.map_err(StorageError::from));
        }
        StoreRequest::Update {
            id,
            mutation,
            respond,
        } => {
            let result = store.update_message(&id, &mutation);
            if let Err(e) = &result {
                error!("Failed to update message {}: {}", id, e);
            }
            let _ = respond.send(result.map_err(StorageError::from));
        }
        StoreRequest::Patch { id, patch, respond } => {
            let result = store.apply_field_patch(&id, &patch);
            match &result {
                Ok(Some(state)) => {
                    events.emit(ClientEvent::DeliveryStateChanged {
                        id: id.clone(),
                        state: *state,
                        error_text: patch.error_text.clone(),
                    });
                }
                Ok(None) => {
                    debug!("Dropped field patch for unknown or settled message {}", id);
                }
                Err(e) => error!("Failed to patch message {}: {}", id, e),
            }
            let _ = respond.send(
                result
                    .map(|state| state.is_some())
                    .map_err(StorageError::from),
            );
        }
        StoreRequest::FetchPage {
            user1,
            user2,
            skip,
            respond,
        } => {
            let result = store.fetch_messages(&user1, &user2, skip);
            let _ = respond.send(result.map_err(StorageError::from));
        }
        StoreRequest::FetchPending { jid, respond } => {
            let result = store.fetch_pending_messages(&jid);
            let _ = respond.send(result.map_err(StorageError::from));
        }
        StoreRequest::FetchLastStamp { respond } => {
            let result = store.fetch_last_message_stamp();
            let _ = respond.send(result.map_err(StorageError::from));
        }
        StoreRequest::RemoveAll {
            account_jid,
            chat_jid,
            respond,
        } => {
            let result = store.remove_messages(&account_jid, chat_jid.as_deref());
            let _ = respond.send(result.map_err(StorageError::from));
        }
    }
}
