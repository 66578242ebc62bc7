use chrono::{DateTime, Utc};
use rusqlite::params;

use estafette_shared::types::{
    ContentsKind, ConversationRef, ForwardSecurityMode, MessageKind, MessageState,
};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, MessageBody};

const MESSAGE_COLUMNS: &str = "id, uid, api_message_id, conversation_scope, conversation_key, \
     kind, contents, outbox, sender_identity, body, state, correlation_id, saved, \
     forward_security_mode, created_at, posted_at, delivered_at, read_at, edited_at, \
     deleted_at, modified_at";

impl Database {
    /// Insert a new message row and return the stored copy with its
    /// assigned id.
    pub fn create_message(&self, message: &Message) -> Result<Message> {
        let (scope, key) = conversation_columns(&message.conversation);
        let body = serde_json::to_string(&message.body)?;

        self.conn().execute(
            "INSERT INTO messages (uid, api_message_id, conversation_scope, conversation_key, \
             kind, contents, outbox, sender_identity, body, state, correlation_id, saved, \
             forward_security_mode, created_at, posted_at, delivered_at, read_at, edited_at, \
             deleted_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                message.uid,
                message.api_message_id,
                scope,
                key,
                message.kind.as_str(),
                message.contents.as_str(),
                message.outbox as i32,
                message.sender_identity,
                body,
                message.state.as_str(),
                message.correlation_id,
                message.saved as i32,
                message.forward_security_mode.as_str(),
                message.created_at.to_rfc3339(),
                message.posted_at.map(|t| t.to_rfc3339()),
                message.delivered_at.map(|t| t.to_rfc3339()),
                message.read_at.map(|t| t.to_rfc3339()),
                message.edited_at.map(|t| t.to_rfc3339()),
                message.deleted_at.map(|t| t.to_rfc3339()),
                message.modified_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        let mut stored = message.clone();
        stored.id = self.conn().last_insert_rowid();
        Ok(stored)
    }

    /// Update an existing row, matched by id.
    pub fn update_message(&self, message: &Message) -> Result<()> {
        let (scope, key) = conversation_columns(&message.conversation);
        let body = serde_json::to_string(&message.body)?;

        let affected = self.conn().execute(
            "UPDATE messages SET uid = ?1, api_message_id = ?2, conversation_scope = ?3, \
             conversation_key = ?4, kind = ?5, contents = ?6, outbox = ?7, sender_identity = ?8, \
             body = ?9, state = ?10, correlation_id = ?11, saved = ?12, \
             forward_security_mode = ?13, created_at = ?14, posted_at = ?15, delivered_at = ?16, \
             read_at = ?17, edited_at = ?18, deleted_at = ?19, modified_at = ?20
             WHERE id = ?21",
            params![
                message.uid,
                message.api_message_id,
                scope,
                key,
                message.kind.as_str(),
                message.contents.as_str(),
                message.outbox as i32,
                message.sender_identity,
                body,
                message.state.as_str(),
                message.correlation_id,
                message.saved as i32,
                message.forward_security_mode.as_str(),
                message.created_at.to_rfc3339(),
                message.posted_at.map(|t| t.to_rfc3339()),
                message.delivered_at.map(|t| t.to_rfc3339()),
                message.read_at.map(|t| t.to_rfc3339()),
                message.edited_at.map(|t| t.to_rfc3339()),
                message.deleted_at.map(|t| t.to_rfc3339()),
                message.modified_at.map(|t| t.to_rfc3339()),
                message.id,
            ],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Insert or, if a row with the same uid already exists, update it.
    pub fn create_or_update_message(&self, message: &Message) -> Result<Message> {
        match self.get_message_by_uid(&message.uid) {
            Ok(existing) => {
                let mut updated = message.clone();
                updated.id = existing.id;
                self.update_message(&updated)?;
                Ok(updated)
            }
            Err(StoreError::NotFound) => self.create_message(message),
            Err(e) => Err(e),
        }
    }

    /// Hard-delete a message row together with its reaction and edit rows.
    ///
    /// Used when a send is cancelled before completion; deleted-for-all
    /// tombstones keep their row and go through [`update_message`] instead.
    ///
    /// [`update_message`]: Database::update_message
    pub fn delete_message(&self, id: i64) -> Result<bool> {
        self.conn()
            .execute("DELETE FROM reactions WHERE message_id = ?1", params![id])?;
        self.conn()
            .execute("DELETE FROM message_edits WHERE message_id = ?1", params![id])?;
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn get_message_by_id(&self, id: i64) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .map_err(map_row_err)
    }

    pub fn get_message_by_uid(&self, uid: &str) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE uid = ?1"),
                params![uid],
                row_to_message,
            )
            .map_err(map_row_err)
    }

    /// Deduplication lookup for inbound processing: find a message by its
    /// wire id and sender identity.
    pub fn get_message_by_api_id_and_identity(
        &self,
        api_message_id: &str,
        sender_identity: &str,
    ) -> Result<Option<Message>> {
        match self.conn().query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE api_message_id = ?1 AND sender_identity = ?2"
            ),
            params![api_message_id, sender_identity],
            row_to_message,
        ) {
            Ok(message) => Ok(Some(message)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// Look up an outgoing message by the wire id assigned at post time.
    /// Used to match incoming delivery receipts.
    pub fn get_outgoing_message_by_api_id(
        &self,
        api_message_id: &str,
    ) -> Result<Option<Message>> {
        match self.conn().query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE api_message_id = ?1 AND outbox = 1"
            ),
            params![api_message_id],
            row_to_message,
        ) {
            Ok(message) => Ok(Some(message)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    pub fn messages_for_conversation(
        &self,
        conversation: &ConversationRef,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let (scope, key) = conversation_columns(conversation);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_scope = ?1 AND conversation_key = ?2
             ORDER BY created_at DESC
             LIMIT ?3 OFFSET ?4"
        ))?;

        let rows = stmt.query_map(params![scope, key, limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn count_messages_for_conversation(&self, conversation: &ConversationRef) -> Result<u64> {
        let (scope, key) = conversation_columns(conversation);
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_scope = ?1 AND conversation_key = ?2",
            params![scope, key],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Incoming messages not yet marked read.
    pub fn unread_count_for_conversation(&self, conversation: &ConversationRef) -> Result<u64> {
        let (scope, key) = conversation_columns(conversation);
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_scope = ?1 AND conversation_key = ?2
               AND outbox = 0 AND read_at IS NULL AND deleted_at IS NULL",
            params![scope, key],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn conversation_columns(conversation: &ConversationRef) -> (&'static str, String) {
    match conversation {
        ConversationRef::Contact(identity) => ("contact", identity.clone()),
        ConversationRef::Group(id) => ("group", id.to_string()),
        ConversationRef::DistributionList(id) => ("distribution-list", id.to_string()),
    }
}

fn map_row_err(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match s {
        Some(s) => parse_ts(idx, &s).map(Some),
        None => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid enum value: {0}")]
struct InvalidEnumValue(String);

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: i64 = row.get(0)?;
    let uid: String = row.get(1)?;
    let api_message_id: Option<String> = row.get(2)?;
    let scope: String = row.get(3)?;
    let key: String = row.get(4)?;
    let kind_str: String = row.get(5)?;
    let contents_str: String = row.get(6)?;
    let outbox_int: i32 = row.get(7)?;
    let sender_identity: Option<String> = row.get(8)?;
    let body_json: String = row.get(9)?;
    let state_str: String = row.get(10)?;
    let correlation_id: Option<String> = row.get(11)?;
    let saved_int: i32 = row.get(12)?;
    let fs_str: String = row.get(13)?;
    let created_str: String = row.get(14)?;
    let posted_str: Option<String> = row.get(15)?;
    let delivered_str: Option<String> = row.get(16)?;
    let read_str: Option<String> = row.get(17)?;
    let edited_str: Option<String> = row.get(18)?;
    let deleted_str: Option<String> = row.get(19)?;
    let modified_str: Option<String> = row.get(20)?;

    let conversation = match scope.as_str() {
        "contact" => ConversationRef::Contact(key),
        "group" => ConversationRef::Group(
            key.parse::<i64>().map_err(|e| conversion_err(4, e))?,
        ),
        "distribution-list" => ConversationRef::DistributionList(
            key.parse::<i64>().map_err(|e| conversion_err(4, e))?,
        ),
        other => return Err(conversion_err(3, InvalidEnumValue(other.to_string()))),
    };

    let kind = MessageKind::from_str(&kind_str)
        .ok_or_else(|| conversion_err(5, InvalidEnumValue(kind_str.clone())))?;
    let contents = ContentsKind::from_str(&contents_str)
        .ok_or_else(|| conversion_err(6, InvalidEnumValue(contents_str.clone())))?;
    let state = MessageState::from_str(&state_str)
        .ok_or_else(|| conversion_err(10, InvalidEnumValue(state_str.clone())))?;
    let forward_security_mode = ForwardSecurityMode::from_str(&fs_str)
        .ok_or_else(|| conversion_err(13, InvalidEnumValue(fs_str.clone())))?;

    let body: MessageBody =
        serde_json::from_str(&body_json).map_err(|e| conversion_err(9, e))?;

    Ok(Message {
        id,
        uid,
        api_message_id,
        conversation,
        kind,
        contents,
        outbox: outbox_int != 0,
        sender_identity,
        body,
        state,
        correlation_id,
        saved: saved_int != 0,
        forward_security_mode,
        created_at: parse_ts(14, &created_str)?,
        posted_at: parse_opt_ts(15, posted_str)?,
        delivered_at: parse_opt_ts(16, delivered_str)?,
        read_at: parse_opt_ts(17, read_str)?,
        edited_at: parse_opt_ts(18, edited_str)?,
        deleted_at: parse_opt_ts(19, deleted_str)?,
        modified_at: parse_opt_ts(20, modified_str)?,
    })
}
