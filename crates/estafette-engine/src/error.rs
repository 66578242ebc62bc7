use thiserror::Error;

use estafette_shared::error::CryptoError;
use estafette_shared::types::MessageState;
use estafette_store::StoreError;

/// Rejections raised before any side effect happens.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message text is empty")]
    EmptyText,

    #[error("Message text is {size} UTF-8 bytes, maximum is {max}")]
    TextTooLong { size: usize, max: usize },

    #[error("Operation is only valid for outgoing messages")]
    NotOutgoing,

    #[error("Reaction states must go through the reaction path")]
    ReactionStateNotAllowed,

    #[error("Message state {0:?} does not allow a resend")]
    NotResendable(MessageState),

    #[error("The {0}-second window for this operation has passed")]
    WindowExpired(i64),

    #[error("Message was never posted")]
    NeverPosted,

    #[error("Message has been deleted")]
    MessageDeleted,

    #[error("Receiver does not support this reaction")]
    ReactionsNotSupported,
}

/// Errors produced by the delivery engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Rejected before any side effect.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Blob upload/download or wire-send failure. Retried by the backoff
    /// policy up to a bound, then surfaces as the send-failed state.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Forward-security key mismatch. Kept distinct from generic transport
    /// failure so the UI can offer a session reset.
    #[error("Forward security error: {0}")]
    Security(String),

    /// A referenced ballot/group/contact is missing; the operation is
    /// abandoned, not retried.
    #[error("Not found: {0}")]
    NotFound(String),

    /// User-initiated cancellation. Not a failure.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
