//! # estafette-engine
//!
//! Message delivery engine: outgoing text and media pipelines, incoming
//! deduplication and receipts, the message lifecycle state machine, and
//! reaction compatibility with the legacy acknowledge/decline receipts.
//!
//! The engine is synchronous; long sends run on worker threads and report
//! through the event bus. Persistence, blob transport and the contact
//! directory are injected as trait objects so embedders wire in their own
//! transport.

pub mod blob;
pub mod cache;
pub mod error;
pub mod events;
pub mod inbound;
pub mod machine;
pub mod media;
pub mod outbound;
pub mod receiver;
pub mod registry;
pub mod resend;
pub mod service;
pub mod state;
pub mod store;

#[cfg(test)]
mod testutil;

pub use blob::{BlobClient, MemoryBlobClient, ProgressFn};
pub use cache::MessageCache;
pub use error::{EngineError, Result, ValidationError};
pub use events::{EventBus, MessageEvent};
pub use inbound::{
    AutoDownloadPolicy, Directory, InboundResolution, IncomingEnvelope, NetworkClass,
    NetworkClassProvider, StaticNetworkClass,
};
pub use machine::{MachineKey, SendMachine, SendMachineRegistry};
pub use media::{
    MediaItem, MediaRepository, MediaSource, MemoryMediaRepository, PassthroughTranscoder,
    TranscodeOutcome, VideoTranscoder,
};
pub use receiver::{resolve_receivers, DeliveryReceiptKind, MessageReceiver};
pub use registry::{CancelToken, CancellationRegistry};
pub use resend::RetryPolicy;
pub use service::MessageService;
pub use state::{can_change_to_state, cleared_state};
pub use store::{MessageStore, SqliteStore};
