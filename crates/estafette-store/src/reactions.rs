use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::{MessageEdit, Reaction};

impl Database {
    /// Insert a reaction row if it does not exist yet.
    ///
    /// The schema enforces uniqueness per (message, sender, emoji), so a
    /// repeated apply from the same sender is a no-op and never creates a
    /// duplicate row.
    pub fn upsert_reaction(
        &self,
        message_id: i64,
        sender_identity: &str,
        emoji: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO reactions (message_id, sender_identity, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![message_id, sender_identity, emoji, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_reaction(
        &self,
        message_id: i64,
        sender_identity: &str,
        emoji: &str,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND sender_identity = ?2 AND emoji = ?3",
            params![message_id, sender_identity, emoji],
        )?;
        Ok(affected > 0)
    }

    /// Remove every reaction row of a message. Used when a message is
    /// deleted for all: the row survives as a tombstone, so reaction rows
    /// are not cascade-deleted by the schema.
    pub fn remove_reactions_for_message(&self, message_id: i64) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(affected)
    }

    pub fn reactions_for_message(&self, message_id: i64) -> Result<Vec<Reaction>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, message_id, sender_identity, emoji, created_at
             FROM reactions WHERE message_id = ?1 ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map(params![message_id], |row| {
            let ts_str: String = row.get(4)?;
            let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;

            Ok(Reaction {
                id: row.get(0)?,
                message_id: row.get(1)?,
                sender_identity: row.get(2)?,
                emoji: row.get(3)?,
                created_at,
            })
        })?;

        let mut reactions = Vec::new();
        for row in rows {
            reactions.push(row?);
        }
        Ok(reactions)
    }

    /// Append one edit-history row holding the superseded text.
    pub fn add_message_edit(
        &self,
        message_id: i64,
        former_text: Option<&str>,
        edited_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO message_edits (message_id, former_text, edited_at)
             VALUES (?1, ?2, ?3)",
            params![message_id, former_text, edited_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn edits_for_message(&self, message_id: i64) -> Result<Vec<MessageEdit>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, message_id, former_text, edited_at
             FROM message_edits WHERE message_id = ?1 ORDER BY edited_at ASC",
        )?;

        let rows = stmt.query_map(params![message_id], |row| {
            let ts_str: String = row.get(3)?;
            let edited_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;

            Ok(MessageEdit {
                id: row.get(0)?,
                message_id: row.get(1)?,
                former_text: row.get(2)?,
                edited_at,
            })
        })?;

        let mut edits = Vec::new();
        for row in rows {
            edits.push(row?);
        }
        Ok(edits)
    }

    /// Remove the edit history of a tombstoned message.
    pub fn remove_edits_for_message(&self, message_id: i64) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM message_edits WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(affected)
    }
}
