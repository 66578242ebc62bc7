//! Storage seam between the engine and the SQLite database.
//!
//! The engine goes through [`MessageStore`] for every persisted mutation.
//! [`SqliteStore`] is the production implementation; it serializes access
//! to the single connection so pipeline threads can share one store.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use estafette_shared::types::ConversationRef;
use estafette_store::{Database, Message, MessageEdit, Reaction, StoreError};

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Message persistence as the engine sees it.
pub trait MessageStore: Send + Sync {
    fn create(&self, message: &Message) -> StoreResult<Message>;

    fn update(&self, message: &Message) -> StoreResult<()>;

    fn create_or_update(&self, message: &Message) -> StoreResult<Message>;

    /// Hard-delete a message row and its reaction/edit rows.
    fn delete(&self, id: i64) -> StoreResult<bool>;

    fn by_uid(&self, uid: &str) -> StoreResult<Message>;

    /// Deduplication lookup for inbound processing.
    fn by_api_id_and_identity(
        &self,
        api_message_id: &str,
        sender_identity: &str,
    ) -> StoreResult<Option<Message>>;

    /// Delivery-receipt lookup: outgoing message by its wire id.
    fn outgoing_by_api_id(&self, api_message_id: &str) -> StoreResult<Option<Message>>;

    fn count_for_conversation(&self, conversation: &ConversationRef) -> StoreResult<u64>;

    fn upsert_reaction(
        &self,
        message_id: i64,
        sender_identity: &str,
        emoji: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    fn remove_reaction(
        &self,
        message_id: i64,
        sender_identity: &str,
        emoji: &str,
    ) -> StoreResult<bool>;

    fn remove_reactions_for_message(&self, message_id: i64) -> StoreResult<usize>;

    fn reactions_for_message(&self, message_id: i64) -> StoreResult<Vec<Reaction>>;

    fn add_message_edit(
        &self,
        message_id: i64,
        former_text: Option<&str>,
        edited_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    fn edits_for_message(&self, message_id: i64) -> StoreResult<Vec<MessageEdit>>;

    fn remove_edits_for_message(&self, message_id: i64) -> StoreResult<usize>;
}

/// [`MessageStore`] over a single SQLite connection.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn db(&self) -> std::sync::MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageStore for SqliteStore {
    fn create(&self, message: &Message) -> StoreResult<Message> {
        self.db().create_message(message)
    }

    fn update(&self, message: &Message) -> StoreResult<()> {
        self.db().update_message(message)
    }

    fn create_or_update(&self, message: &Message) -> StoreResult<Message> {
        self.db().create_or_update_message(message)
    }

    fn delete(&self, id: i64) -> StoreResult<bool> {
        self.db().delete_message(id)
    }

    fn by_uid(&self, uid: &str) -> StoreResult<Message> {
        self.db().get_message_by_uid(uid)
    }

    fn by_api_id_and_identity(
        &self,
        api_message_id: &str,
        sender_identity: &str,
    ) -> StoreResult<Option<Message>> {
        self.db()
            .get_message_by_api_id_and_identity(api_message_id, sender_identity)
    }

    fn outgoing_by_api_id(&self, api_message_id: &str) -> StoreResult<Option<Message>> {
        self.db().get_outgoing_message_by_api_id(api_message_id)
    }

    fn count_for_conversation(&self, conversation: &ConversationRef) -> StoreResult<u64> {
        self.db().count_messages_for_conversation(conversation)
    }

    fn upsert_reaction(
        &self,
        message_id: i64,
        sender_identity: &str,
        emoji: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.db()
            .upsert_reaction(message_id, sender_identity, emoji, at)
    }

    fn remove_reaction(
        &self,
        message_id: i64,
        sender_identity: &str,
        emoji: &str,
    ) -> StoreResult<bool> {
        self.db().remove_reaction(message_id, sender_identity, emoji)
    }

    fn remove_reactions_for_message(&self, message_id: i64) -> StoreResult<usize> {
        self.db().remove_reactions_for_message(message_id)
    }

    fn reactions_for_message(&self, message_id: i64) -> StoreResult<Vec<Reaction>> {
        self.db().reactions_for_message(message_id)
    }

    fn add_message_edit(
        &self,
        message_id: i64,
        former_text: Option<&str>,
        edited_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.db().add_message_edit(message_id, former_text, edited_at)
    }

    fn edits_for_message(&self, message_id: i64) -> StoreResult<Vec<MessageEdit>> {
        self.db().edits_for_message(message_id)
    }

    fn remove_edits_for_message(&self, message_id: i64) -> StoreResult<usize> {
        self.db().remove_edits_for_message(message_id)
    }
}
