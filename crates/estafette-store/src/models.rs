//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to an embedding UI layer, and so the type-tagged payload can be
//! stored as a JSON column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use estafette_shared::types::{
    BlobId, ContentsKind, ConversationRef, ForwardSecurityMode, MessageKind, MessageState,
};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single message, outgoing or incoming.
///
/// The store is the owner of record; in-flight copies live in the engine's
/// cache and are reconciled back after every persisted mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Locally unique id, assigned by the store on insert (0 before).
    pub id: i64,
    /// Conversation-scoped unique string, assigned at creation.
    pub uid: String,
    /// Globally unique wire message id; absent until the transport accepted
    /// the message (outgoing) or taken from the envelope (incoming).
    pub api_message_id: Option<String>,
    /// The single conversation owning this message.
    pub conversation: ConversationRef,
    /// Fine-grained message kind.
    pub kind: MessageKind,
    /// Coarser content class used for filtering and auto-download policy.
    pub contents: ContentsKind,
    /// Direction. Immutable after creation.
    pub outbox: bool,
    /// Sender identity for incoming messages (group messages in particular).
    pub sender_identity: Option<String>,
    /// Type-tagged payload.
    pub body: MessageBody,
    /// Lifecycle state.
    pub state: MessageState,
    /// Shared by all per-receiver copies of one multi-recipient send.
    pub correlation_id: Option<String>,
    /// Whether the row is durably persisted or still a placeholder.
    pub saved: bool,
    /// Which key-agreement scheme protected this message. Informational.
    pub forward_security_mode: ForwardSecurityMode,
    pub created_at: DateTime<Utc>,
    /// Set when the message was actually handed to the transport.
    pub posted_at: Option<DateTime<Utc>>,
    /// Set at most once.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Set at most once.
    pub read_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    /// Once set the message is a tombstone; no further transitions apply.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Bumped on every state-relevant mutation.
    pub modified_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a fresh local message model. The id stays 0 until inserted.
    pub fn new(
        conversation: ConversationRef,
        kind: MessageKind,
        contents: ContentsKind,
        outbox: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            uid: Uuid::new_v4().to_string(),
            api_message_id: None,
            conversation,
            kind,
            contents,
            outbox,
            sender_identity: None,
            body: MessageBody::Text(TextBody::default()),
            state: MessageState::Pending,
            correlation_id: None,
            saved: false,
            forward_security_mode: ForwardSecurityMode::None,
            created_at,
            posted_at: None,
            delivered_at: None,
            read_at: None,
            edited_at: None,
            deleted_at: None,
            modified_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Text body, if this is a text message.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(t) => Some(t.text.as_str()),
            _ => None,
        }
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        match &self.body {
            MessageBody::Media(f) => Some(f),
            _ => None,
        }
    }

    pub fn file_info_mut(&mut self) -> Option<&mut FileInfo> {
        match &mut self.body {
            MessageBody::Media(f) => Some(f),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Type-tagged message payload, stored as one JSON column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageBody {
    Text(TextBody),
    Media(FileInfo),
    Location(LocationInfo),
    Ballot(BallotRef),
    Status(StatusInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TextBody {
    pub text: String,
    /// Wire id of the quoted message, if any.
    pub quoted_api_message_id: Option<String>,
}

/// Descriptor for image/video/audio/file payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    /// Content id of the uploaded (encrypted) data blob.
    pub blob_id: Option<BlobId>,
    /// Content id of the uploaded (encrypted) thumbnail blob.
    pub thumbnail_blob_id: Option<BlobId>,
    /// Hex-encoded per-message symmetric key.
    pub encryption_key: Option<String>,
    pub mime_type: String,
    pub file_name: Option<String>,
    /// Plaintext size in bytes.
    pub file_size: u64,
    /// Media duration in seconds, for audio/video.
    pub duration_secs: Option<f64>,
    pub rendering: RenderingHint,
    pub caption: Option<String>,
    /// Whether the content blob has been downloaded locally (incoming).
    pub downloaded: bool,
}

impl FileInfo {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            blob_id: None,
            thumbnail_blob_id: None,
            encryption_key: None,
            mime_type: mime_type.into(),
            file_name: None,
            file_size: 0,
            duration_secs: None,
            rendering: RenderingHint::File,
            caption: None,
            downloaded: false,
        }
    }
}

/// How a file message should be presented.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RenderingHint {
    /// Generic file attachment.
    File,
    /// Inline media (image/video/voice message).
    Media,
    /// Sticker, rendered without a bubble.
    Sticker,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationInfo {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported accuracy in meters.
    pub accuracy_m: f64,
    pub poi_name: Option<String>,
    pub address: Option<String>,
}

/// Reference to a ballot owned by the (external) ballot directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BallotRef {
    pub ballot_id: i64,
    pub event: BallotEvent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BallotEvent {
    Create,
    Vote,
    Close,
}

/// Structured payload of status/system messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusInfo {
    pub status_kind: String,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

/// One emoji reaction from one sender on one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub id: i64,
    pub message_id: i64,
    pub sender_identity: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Edit history
// ---------------------------------------------------------------------------

/// One applied edit, holding the superseded text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEdit {
    pub id: i64,
    pub message_id: i64,
    pub former_text: Option<String>,
    pub edited_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_json_tagging() {
        let body = MessageBody::Location(LocationInfo {
            latitude: 46.94,
            longitude: 7.44,
            accuracy_m: 12.0,
            poi_name: Some("Bundesplatz".into()),
            address: None,
        });
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"type\":\"location\""));
        let back: MessageBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn new_message_defaults() {
        let m = Message::new(
            ConversationRef::Contact("PEER0001".into()),
            MessageKind::Text,
            ContentsKind::Text,
            true,
            Utc::now(),
        );
        assert_eq!(m.id, 0);
        assert_eq!(m.state, MessageState::Pending);
        assert!(!m.saved);
        assert!(!m.is_deleted());
        assert!(!m.uid.is_empty());
    }
}
