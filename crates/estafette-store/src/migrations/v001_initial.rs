//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `messages`, `reactions` and
//! `message_edits`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    uid                   TEXT NOT NULL UNIQUE,       -- UUID v4
    api_message_id        TEXT,                       -- wire id, set on acceptance
    conversation_scope    TEXT NOT NULL,              -- contact / group / distribution-list
    conversation_key      TEXT NOT NULL,              -- identity string or numeric id
    kind                  TEXT NOT NULL,
    contents              TEXT NOT NULL,
    outbox                INTEGER NOT NULL,           -- boolean 0/1
    sender_identity       TEXT,
    body                  TEXT NOT NULL,              -- type-tagged JSON payload
    state                 TEXT NOT NULL,
    correlation_id        TEXT,
    saved                 INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    forward_security_mode TEXT NOT NULL DEFAULT 'none',
    created_at            TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    posted_at             TEXT,
    delivered_at          TEXT,
    read_at               TEXT,
    edited_at             TEXT,
    deleted_at            TEXT,
    modified_at           TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_scope, conversation_key, created_at DESC);

-- deduplication lookup for inbound processing
CREATE INDEX IF NOT EXISTS idx_messages_api_sender
    ON messages(api_message_id, sender_identity);

-- ----------------------------------------------------------------
-- Reactions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id      INTEGER NOT NULL,
    sender_identity TEXT NOT NULL,
    emoji           TEXT NOT NULL,
    created_at      TEXT NOT NULL,

    UNIQUE (message_id, sender_identity, emoji),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);

-- ----------------------------------------------------------------
-- Edit history
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_edits (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id  INTEGER NOT NULL,
    former_text TEXT,
    edited_at   TEXT NOT NULL,

    FOREIGN KEY (message_id) REFERENCES messages(id)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
