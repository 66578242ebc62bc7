//! The delivery engine's central service.
//!
//! [`MessageService`] owns the cache, the send machine and cancellation
//! registries and the event bus, and borrows its collaborators (store,
//! blob transport, directory) through trait objects. The pipelines are
//! implemented in the sibling modules as further `impl MessageService`
//! blocks: outgoing sends in `outbound`, receipt/receive processing in
//! `inbound` and `state`, retry in `resend`.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::blob::BlobClient;
use crate::cache::MessageCache;
use crate::events::{EventBus, MessageEvent};
use crate::inbound::{
    AutoDownloadPolicy, Directory, NetworkClassProvider, StaticNetworkClass,
};
use crate::machine::SendMachineRegistry;
use crate::media::{MediaRepository, MemoryMediaRepository, PassthroughTranscoder, VideoTranscoder};
use crate::registry::CancellationRegistry;
use crate::resend::RetryPolicy;
use crate::store::MessageStore;

pub struct MessageService {
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) blobs: Arc<dyn BlobClient>,
    pub(crate) directory: Arc<dyn Directory>,
    pub(crate) media: Arc<dyn MediaRepository>,
    pub(crate) transcoder: Arc<dyn VideoTranscoder>,
    pub(crate) network: Arc<dyn NetworkClassProvider>,
    pub(crate) auto_download: AutoDownloadPolicy,
    pub(crate) retry: RetryPolicy,
    pub(crate) cache: MessageCache,
    pub(crate) machines: SendMachineRegistry,
    pub(crate) cancellations: CancellationRegistry,
    pub(crate) events: EventBus,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        blobs: Arc<dyn BlobClient>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            store,
            blobs,
            directory,
            media: Arc::new(MemoryMediaRepository::new()),
            transcoder: Arc::new(PassthroughTranscoder),
            network: Arc::new(StaticNetworkClass::wifi()),
            auto_download: AutoDownloadPolicy::default(),
            retry: RetryPolicy::default(),
            cache: MessageCache::new(),
            machines: SendMachineRegistry::new(),
            cancellations: CancellationRegistry::new(),
            events: EventBus::default(),
        }
    }

    pub fn with_media_repository(mut self, media: Arc<dyn MediaRepository>) -> Self {
        self.media = media;
        self
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn VideoTranscoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    pub fn with_network_provider(mut self, network: Arc<dyn NetworkClassProvider>) -> Self {
        self.network = network;
        self
    }

    pub fn with_auto_download(mut self, policy: AutoDownloadPolicy) -> Self {
        self.auto_download = policy;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Subscribe to message events.
    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub fn media_repository(&self) -> &Arc<dyn MediaRepository> {
        &self.media
    }

    /// Live in-flight operations: send machines plus cancellation handles.
    /// Empty once every pipeline finished or was cancelled.
    pub fn in_flight(&self) -> usize {
        self.machines.len() + self.cancellations.len()
    }
}
