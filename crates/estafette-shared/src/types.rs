use serde::{Deserialize, Serialize};

use crate::constants::BLOB_ID_SIZE;

/// Content id of an uploaded blob (BLAKE3 hash of the encrypted bytes),
/// stored as hex in SQLite and in wire envelopes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlobId(pub [u8; BLOB_ID_SIZE]);

impl BlobId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let mut arr = [0u8; BLOB_ID_SIZE];
        if bytes.len() != BLOB_ID_SIZE {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Which kind of conversation a message belongs to. Used to partition the
/// message cache and to key send machines and cancellation handles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConversationScope {
    Contact,
    Group,
    DistributionList,
}

/// Reference to the single conversation owning a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConversationRef {
    /// 1:1 conversation, keyed by the peer's identity string.
    Contact(String),
    /// Group conversation, keyed by the local group id.
    Group(i64),
    /// Distribution list, keyed by the local list id.
    DistributionList(i64),
}

impl ConversationRef {
    pub fn scope(&self) -> ConversationScope {
        match self {
            ConversationRef::Contact(_) => ConversationScope::Contact,
            ConversationRef::Group(_) => ConversationScope::Group,
            ConversationRef::DistributionList(_) => ConversationScope::DistributionList,
        }
    }
}

impl std::fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationRef::Contact(identity) => write!(f, "contact:{identity}"),
            ConversationRef::Group(id) => write!(f, "group:{id}"),
            ConversationRef::DistributionList(id) => write!(f, "distribution-list:{id}"),
        }
    }
}

/// Fine-grained message kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    File,
    Location,
    Ballot,
    VoipStatus,
    GroupCallStatus,
    ForwardSecurityStatus,
    GroupStatus,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::File => "file",
            MessageKind::Location => "location",
            MessageKind::Ballot => "ballot",
            MessageKind::VoipStatus => "voip-status",
            MessageKind::GroupCallStatus => "group-call-status",
            MessageKind::ForwardSecurityStatus => "forward-security-status",
            MessageKind::GroupStatus => "group-status",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            "audio" => Some(MessageKind::Audio),
            "file" => Some(MessageKind::File),
            "location" => Some(MessageKind::Location),
            "ballot" => Some(MessageKind::Ballot),
            "voip-status" => Some(MessageKind::VoipStatus),
            "group-call-status" => Some(MessageKind::GroupCallStatus),
            "forward-security-status" => Some(MessageKind::ForwardSecurityStatus),
            "group-status" => Some(MessageKind::GroupStatus),
            _ => None,
        }
    }

    /// Kinds that carry an encrypted data blob.
    pub fn has_data_file(&self) -> bool {
        matches!(
            self,
            MessageKind::Image | MessageKind::Video | MessageKind::Audio | MessageKind::File
        )
    }

    /// Kinds that may carry a thumbnail blob.
    pub fn can_have_thumbnail(&self) -> bool {
        matches!(self, MessageKind::Image | MessageKind::Video | MessageKind::File)
    }
}

/// Coarser content class used for conversation filtering and the
/// auto-download policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContentsKind {
    Text,
    Image,
    Video,
    Audio,
    File,
    Location,
    Ballot,
    Status,
}

impl ContentsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentsKind::Text => "text",
            ContentsKind::Image => "image",
            ContentsKind::Video => "video",
            ContentsKind::Audio => "audio",
            ContentsKind::File => "file",
            ContentsKind::Location => "location",
            ContentsKind::Ballot => "ballot",
            ContentsKind::Status => "status",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ContentsKind::Text),
            "image" => Some(ContentsKind::Image),
            "video" => Some(ContentsKind::Video),
            "audio" => Some(ContentsKind::Audio),
            "file" => Some(ContentsKind::File),
            "location" => Some(ContentsKind::Location),
            "ballot" => Some(ContentsKind::Ballot),
            "status" => Some(ContentsKind::Status),
            _ => None,
        }
    }

    /// Whether a conversation's "last activity" timestamp is bumped when a
    /// message of this class arrives.
    pub fn bumps_conversation(&self) -> bool {
        !matches!(self, ContentsKind::Status)
    }
}

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageState {
    Pending,
    Transcoding,
    Uploading,
    Sending,
    Sent,
    Delivered,
    Read,
    SendFailed,
    FsKeyMismatch,
    Consumed,
    /// Legacy acknowledge receipt, kept for reaction compatibility.
    UserAck,
    /// Legacy decline receipt, kept for reaction compatibility.
    UserDec,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Pending => "pending",
            MessageState::Transcoding => "transcoding",
            MessageState::Uploading => "uploading",
            MessageState::Sending => "sending",
            MessageState::Sent => "sent",
            MessageState::Delivered => "delivered",
            MessageState::Read => "read",
            MessageState::SendFailed => "send-failed",
            MessageState::FsKeyMismatch => "fs-key-mismatch",
            MessageState::Consumed => "consumed",
            MessageState::UserAck => "user-ack",
            MessageState::UserDec => "user-dec",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageState::Pending),
            "transcoding" => Some(MessageState::Transcoding),
            "uploading" => Some(MessageState::Uploading),
            "sending" => Some(MessageState::Sending),
            "sent" => Some(MessageState::Sent),
            "delivered" => Some(MessageState::Delivered),
            "read" => Some(MessageState::Read),
            "send-failed" => Some(MessageState::SendFailed),
            "fs-key-mismatch" => Some(MessageState::FsKeyMismatch),
            "consumed" => Some(MessageState::Consumed),
            "user-ack" => Some(MessageState::UserAck),
            "user-dec" => Some(MessageState::UserDec),
            _ => None,
        }
    }

    /// Reaction-class states are never applied through the regular outgoing
    /// state transition path.
    pub fn is_reaction(&self) -> bool {
        matches!(self, MessageState::UserAck | MessageState::UserDec)
    }

    /// States a user-initiated resend may start from.
    pub fn is_resendable(&self) -> bool {
        matches!(self, MessageState::SendFailed | MessageState::FsKeyMismatch)
    }
}

/// Which key-agreement scheme protected a message. Informational only;
/// never drives state transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ForwardSecurityMode {
    #[default]
    None,
    TwoDh,
    FourDh,
}

impl ForwardSecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardSecurityMode::None => "none",
            ForwardSecurityMode::TwoDh => "2dh",
            ForwardSecurityMode::FourDh => "4dh",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ForwardSecurityMode::None),
            "2dh" => Some(ForwardSecurityMode::TwoDh),
            "4dh" => Some(ForwardSecurityMode::FourDh),
            _ => None,
        }
    }
}

/// How far a receiver's client understands emoji reactions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReactionSupport {
    None,
    /// Only the legacy acknowledge/decline pair is understood.
    Partial,
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_id_hex_roundtrip() {
        let id = BlobId([7u8; 32]);
        assert_eq!(BlobId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(BlobId::from_hex("abcd").is_err());
    }

    #[test]
    fn state_str_roundtrip() {
        for state in [
            MessageState::Pending,
            MessageState::Transcoding,
            MessageState::Uploading,
            MessageState::Sending,
            MessageState::Sent,
            MessageState::Delivered,
            MessageState::Read,
            MessageState::SendFailed,
            MessageState::FsKeyMismatch,
            MessageState::Consumed,
            MessageState::UserAck,
            MessageState::UserDec,
        ] {
            assert_eq!(MessageState::from_str(state.as_str()), Some(state));
        }
    }

    #[test]
    fn kind_str_roundtrip() {
        assert_eq!(MessageKind::from_str("voip-status"), Some(MessageKind::VoipStatus));
        assert_eq!(MessageKind::from_str("nope"), None);
        assert!(MessageKind::Video.has_data_file());
        assert!(MessageKind::Video.can_have_thumbnail());
        assert!(!MessageKind::Audio.can_have_thumbnail());
    }
}
