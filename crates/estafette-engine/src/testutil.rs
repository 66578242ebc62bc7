//! Shared fixtures for the engine's tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use estafette_shared::types::{
    ContentsKind, ConversationRef, ForwardSecurityMode, MessageKind, ReactionSupport,
};
use estafette_store::{BallotRef, Database, FileInfo, LocationInfo, Message, MessageBody, TextBody};

use crate::blob::{BlobClient, MemoryBlobClient, ProgressFn};
use crate::error::{EngineError, Result};
use crate::inbound::{Directory, InboundResolution, IncomingEnvelope};
use crate::receiver::{DeliveryReceiptKind, MessageReceiver};
use crate::registry::CancelToken;
use crate::resend::RetryPolicy;
use crate::service::MessageService;
use crate::store::SqliteStore;

/// Scriptable receiver that accepts or fails envelope sends and records
/// delivery receipts.
pub(crate) struct StubReceiver {
    conversation: ConversationRef,
    members: Option<Vec<Arc<dyn MessageReceiver>>>,
    fail_remaining: AtomicUsize,
    support: Mutex<ReactionSupport>,
    receipts: Mutex<Vec<(DeliveryReceiptKind, Vec<String>)>>,
    reactions: Mutex<Vec<(String, String)>>,
}

impl StubReceiver {
    pub fn contact(identity: &str) -> Self {
        Self {
            conversation: ConversationRef::Contact(identity.into()),
            members: None,
            fail_remaining: AtomicUsize::new(0),
            support: Mutex::new(ReactionSupport::Full),
            receipts: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
        }
    }

    pub fn list(id: i64, members: Vec<Arc<dyn MessageReceiver>>) -> Self {
        Self {
            conversation: ConversationRef::DistributionList(id),
            members: Some(members),
            fail_remaining: AtomicUsize::new(0),
            support: Mutex::new(ReactionSupport::Full),
            receipts: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reaction_support(&self, support: ReactionSupport) {
        *self.support.lock().unwrap_or_else(PoisonError::into_inner) = support;
    }

    /// Reaction envelopes accepted so far, as (wire id, emoji) pairs.
    pub fn reaction_envelopes(&self) -> Vec<(String, String)> {
        self.reactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make the next `n` envelope sends fail with a transport error.
    pub fn fail_next_sends(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn receipts(&self) -> Vec<(DeliveryReceiptKind, Vec<String>)> {
        self.receipts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_send(&self) -> Result<String> {
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(EngineError::Transport("stub transport refused".into()))
        } else {
            Ok(Uuid::new_v4().simple().to_string())
        }
    }
}

impl MessageReceiver for StubReceiver {
    fn conversation(&self) -> ConversationRef {
        self.conversation.clone()
    }

    fn display_name(&self) -> String {
        self.conversation.to_string()
    }

    fn members(&self) -> Option<Vec<Arc<dyn MessageReceiver>>> {
        self.members.clone()
    }

    fn send_text(&self, _message: &Message, _text: &str) -> Result<String> {
        self.next_send()
    }

    fn send_location(&self, _message: &Message, _location: &LocationInfo) -> Result<String> {
        self.next_send()
    }

    fn send_ballot(&self, _message: &Message, _ballot: &BallotRef) -> Result<String> {
        self.next_send()
    }

    fn send_file_envelope(&self, _message: &Message, _info: &FileInfo) -> Result<String> {
        self.next_send()
    }

    fn reaction_support(&self) -> ReactionSupport {
        *self.support.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_reaction_envelope(&self, api_message_id: &str, emoji: &str) -> Result<()> {
        self.next_send()?;
        self.reactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((api_message_id.to_string(), emoji.to_string()));
        Ok(())
    }

    fn send_edit_envelope(&self, _api_message_id: &str, _new_text: &str) -> Result<()> {
        self.next_send().map(|_| ())
    }

    fn send_delete_envelope(&self, _api_message_id: &str) -> Result<()> {
        self.next_send().map(|_| ())
    }

    fn send_delivery_receipt(
        &self,
        kind: DeliveryReceiptKind,
        api_message_ids: &[String],
    ) -> Result<()> {
        self.receipts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, api_message_ids.to_vec()));
        Ok(())
    }
}

/// Directory resolving every envelope to one stub receiver, optionally
/// switched into rejection mode.
pub(crate) struct StaticDirectory {
    receiver: Arc<StubReceiver>,
    unknown_sender: std::sync::atomic::AtomicBool,
    touches: AtomicUsize,
    promotions: AtomicUsize,
}

impl StaticDirectory {
    pub fn new(receiver: Arc<StubReceiver>) -> Self {
        Self {
            receiver,
            unknown_sender: std::sync::atomic::AtomicBool::new(false),
            touches: AtomicUsize::new(0),
            promotions: AtomicUsize::new(0),
        }
    }

    pub fn reject_unknown_sender(&self) {
        self.unknown_sender.store(true, Ordering::SeqCst);
    }

    pub fn touched(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn promotions(&self) -> usize {
        self.promotions.load(Ordering::SeqCst)
    }
}

impl Directory for StaticDirectory {
    fn resolve_incoming(&self, _envelope: &IncomingEnvelope) -> InboundResolution {
        if self.unknown_sender.load(Ordering::SeqCst) {
            InboundResolution::UnknownSender
        } else {
            InboundResolution::Accepted(self.receiver.clone())
        }
    }

    fn touch_conversation(&self, _conversation: &ConversationRef, _at: chrono::DateTime<Utc>) {
        self.touches.fetch_add(1, Ordering::SeqCst);
    }

    fn promote_to_direct_contact(&self, _identity: &str) {
        self.promotions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Blob client whose uploads block until cancelled. Lets tests catch a
/// pipeline mid-upload.
pub(crate) struct BlockingBlobClient;

impl BlobClient for BlockingBlobClient {
    fn upload(
        &self,
        _data: &[u8],
        _persist: bool,
        progress: &ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<estafette_shared::types::BlobId> {
        progress(0);
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn download(&self, _id: &estafette_shared::types::BlobId) -> Result<Vec<u8>> {
        Err(EngineError::Transport("blocking client stores nothing".into()))
    }

    fn mark_done(&self, _id: &estafette_shared::types::BlobId) -> Result<()> {
        Ok(())
    }
}

fn build_service(blobs: Arc<dyn BlobClient>) -> (MessageService, Arc<StubReceiver>, Arc<StaticDirectory>) {
    let db = match Database::open_in_memory() {
        Ok(db) => db,
        Err(e) => panic!("in-memory database: {e}"),
    };
    let stub = Arc::new(StubReceiver::contact("PEER0001"));
    let directory = Arc::new(StaticDirectory::new(stub.clone()));
    let service = MessageService::new(Arc::new(SqliteStore::new(db)), blobs, directory.clone())
        .with_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
        });
    (service, stub, directory)
}

pub(crate) fn service() -> MessageService {
    build_service(Arc::new(MemoryBlobClient::new())).0
}

pub(crate) fn service_with_receiver() -> (MessageService, Arc<StubReceiver>) {
    let (service, stub, _) = build_service(Arc::new(MemoryBlobClient::new()));
    (service, stub)
}

pub(crate) fn service_full() -> (MessageService, Arc<StubReceiver>, Arc<StaticDirectory>) {
    build_service(Arc::new(MemoryBlobClient::new()))
}

pub(crate) fn service_with_blocking_blobs() -> (MessageService, Arc<StubReceiver>) {
    let (service, stub, _) = build_service(Arc::new(BlockingBlobClient));
    (service, stub)
}

/// A persisted outgoing text message, as if it had just been queued.
pub(crate) fn outgoing_text_message(service: &MessageService, text: &str) -> Message {
    let mut message = Message::new(
        ConversationRef::Contact("PEER0001".into()),
        MessageKind::Text,
        ContentsKind::Text,
        true,
        Utc::now(),
    );
    message.body = MessageBody::Text(TextBody {
        text: text.into(),
        quoted_api_message_id: None,
    });
    message.saved = true;
    match service.store.create(&message) {
        Ok(stored) => stored,
        Err(e) => panic!("create message: {e}"),
    }
}

pub(crate) fn text_envelope(api_message_id: &str, sender: &str, text: &str) -> IncomingEnvelope {
    IncomingEnvelope {
        api_message_id: api_message_id.into(),
        sender_identity: sender.into(),
        conversation: ConversationRef::Contact(sender.into()),
        kind: MessageKind::Text,
        contents: ContentsKind::Text,
        body: MessageBody::Text(TextBody {
            text: text.into(),
            quoted_api_message_id: None,
        }),
        created_at: Utc::now(),
        forward_security_mode: ForwardSecurityMode::None,
    }
}
