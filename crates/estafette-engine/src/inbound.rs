//! Incoming message processing.
//!
//! The transport redelivers envelopes until the engine acknowledges them,
//! so the pipeline is written to be idempotent: a message is looked up by
//! wire id and sender before anything else, and only a fully persisted row
//! counts as processed. Returning `false` from [`process_incoming_message`]
//! asks the transport to try again later.
//!
//! [`process_incoming_message`]: MessageService::process_incoming_message

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use estafette_shared::constants::FILE_NONCE;
use estafette_shared::crypto::decrypt_with_nonce;
use estafette_shared::types::{
    ContentsKind, ConversationRef, ForwardSecurityMode, MessageKind, MessageState,
};
use estafette_store::{Message, MessageBody};

use std::sync::Arc;

use crate::error::Result;
use crate::events::MessageEvent;
use crate::machine::MachineKey;
use crate::receiver::{DeliveryReceiptKind, MessageReceiver};
use crate::service::MessageService;
use crate::state::can_change_to_state;

/// One decoded incoming message, after transport decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingEnvelope {
    pub api_message_id: String,
    pub sender_identity: String,
    pub conversation: ConversationRef,
    pub kind: MessageKind,
    pub contents: ContentsKind,
    pub body: MessageBody,
    /// Sender-side creation time, taken from the envelope.
    pub created_at: DateTime<Utc>,
    pub forward_security_mode: ForwardSecurityMode,
}

/// How the directory resolved an incoming envelope.
pub enum InboundResolution {
    /// Known sender and conversation; the receiver answers receipts.
    Accepted(Arc<dyn MessageReceiver>),
    UnknownSender,
    UnknownConversation,
    Blocked,
}

/// Contact and conversation directory. Owned by the embedder.
pub trait Directory: Send + Sync {
    fn resolve_incoming(&self, envelope: &IncomingEnvelope) -> InboundResolution;

    /// Bump the conversation's last-activity timestamp.
    fn touch_conversation(&self, conversation: &ConversationRef, at: DateTime<Utc>);

    /// A contact that writes to us 1:1 is no longer a group-only contact.
    fn promote_to_direct_contact(&self, identity: &str);
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkClass {
    Wifi,
    Cellular,
    Offline,
}

pub trait NetworkClassProvider: Send + Sync {
    fn network_class(&self) -> NetworkClass;
}

/// Fixed network class, for embedders without connectivity callbacks.
pub struct StaticNetworkClass(pub NetworkClass);

impl StaticNetworkClass {
    pub fn wifi() -> Self {
        Self(NetworkClass::Wifi)
    }
}

impl NetworkClassProvider for StaticNetworkClass {
    fn network_class(&self) -> NetworkClass {
        self.0
    }
}

/// When incoming media is fetched without the user asking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoDownloadPolicy {
    pub on_wifi: bool,
    pub on_cellular: bool,
    /// Over cellular, only blobs up to this size are fetched.
    pub max_cellular_size: u64,
}

impl Default for AutoDownloadPolicy {
    fn default() -> Self {
        Self {
            on_wifi: true,
            on_cellular: true,
            max_cellular_size: 5 * 1024 * 1024,
        }
    }
}

impl AutoDownloadPolicy {
    pub fn should_download(&self, class: NetworkClass, size: u64) -> bool {
        match class {
            NetworkClass::Wifi => self.on_wifi,
            NetworkClass::Cellular => self.on_cellular && size <= self.max_cellular_size,
            NetworkClass::Offline => false,
        }
    }
}

impl MessageService {
    /// Process one incoming envelope. Returns whether the envelope is
    /// settled and may be acknowledged to the transport; `false` means
    /// processing failed and the envelope should be redelivered.
    pub fn process_incoming_message(&self, envelope: IncomingEnvelope) -> bool {
        match self.process_incoming_inner(&envelope) {
            Ok(settled) => settled,
            Err(e) => {
                tracing::error!(
                    api_message_id = %envelope.api_message_id,
                    error = %e,
                    "incoming message processing failed"
                );
                false
            }
        }
    }

    fn process_incoming_inner(&self, envelope: &IncomingEnvelope) -> Result<bool> {
        let scope = envelope.conversation.scope();

        // Dedup, cheapest check first.
        let existing = match self.cache.get_by_api_id_and_identity(
            scope,
            &envelope.api_message_id,
            &envelope.sender_identity,
        ) {
            Some(message) => Some(message),
            None => self
                .store
                .by_api_id_and_identity(&envelope.api_message_id, &envelope.sender_identity)?,
        };
        if let Some(existing) = &existing {
            if existing.saved {
                tracing::info!(
                    api_message_id = %envelope.api_message_id,
                    "dropping already-processed incoming message"
                );
                return Ok(true);
            }
            // an earlier attempt died between insert and save; finish it
        }

        let receiver = match self.directory.resolve_incoming(envelope) {
            InboundResolution::Accepted(receiver) => receiver,
            InboundResolution::UnknownSender => {
                tracing::warn!(sender = %envelope.sender_identity, "message from unknown sender");
                return Ok(true);
            }
            InboundResolution::UnknownConversation => {
                tracing::warn!(conversation = %envelope.conversation, "message for unknown conversation");
                return Ok(true);
            }
            InboundResolution::Blocked => {
                tracing::info!(sender = %envelope.sender_identity, "dropping message from blocked sender");
                return Ok(true);
            }
        };

        if envelope.contents.bumps_conversation() {
            self.directory
                .touch_conversation(&envelope.conversation, envelope.created_at);
        }
        if matches!(envelope.conversation, ConversationRef::Contact(_)) {
            self.directory
                .promote_to_direct_contact(&envelope.sender_identity);
        }

        let now = Utc::now();
        let mut message = existing.unwrap_or_else(|| {
            Message::new(
                envelope.conversation.clone(),
                envelope.kind,
                envelope.contents,
                false,
                envelope.created_at,
            )
        });
        message.api_message_id = Some(envelope.api_message_id.clone());
        message.sender_identity = Some(envelope.sender_identity.clone());
        message.body = envelope.body.clone();
        message.forward_security_mode = envelope.forward_security_mode;
        message.state = MessageState::Delivered;
        message.delivered_at = Some(now);
        message.saved = true;

        if message.kind.has_data_file() {
            self.maybe_auto_download(&mut message);
        }

        let message = self.store.create_or_update(&message)?;
        self.cache.put(&message);
        self.events.emit(MessageEvent::Created(message.clone()));
        tracing::info!(
            uid = %message.uid,
            from = %envelope.sender_identity,
            kind = message.kind.as_str(),
            "incoming message stored"
        );

        if !receiver.no_delivery_receipts() {
            if let Err(e) = receiver.send_delivery_receipt(
                DeliveryReceiptKind::Received,
                std::slice::from_ref(&envelope.api_message_id),
            ) {
                // the receipt is best-effort; the message itself is settled
                tracing::warn!(error = %e, "failed to send delivery receipt");
            }
        }
        Ok(true)
    }

    /// Fetch and decrypt incoming media per the auto-download policy.
    /// Failures leave the message downloadable on demand, never unsettled.
    fn maybe_auto_download(&self, message: &mut Message) {
        let Some(info) = message.file_info() else {
            return;
        };
        let Some(blob_id) = info.blob_id else {
            return;
        };
        let key_hex = info.encryption_key.clone();
        let size = info.file_size;

        let class = self.network.network_class();
        if !self.auto_download.should_download(class, size) {
            tracing::debug!(uid = %message.uid, ?class, size, "skipping auto-download");
            return;
        }

        let fetched = (|| -> Result<Vec<u8>> {
            let key = crate::outbound::key_from_hex(key_hex.as_deref().unwrap_or_default())?;
            let ciphertext = self.blobs.download(&blob_id)?;
            let plaintext = decrypt_with_nonce(&key, &FILE_NONCE, &ciphertext)?;
            self.media
                .store_content(&MachineKey::for_message(message), plaintext.clone())?;
            self.blobs.mark_done(&blob_id)?;
            Ok(plaintext)
        })();

        match fetched {
            Ok(_) => {
                if let Some(info) = message.file_info_mut() {
                    info.downloaded = true;
                }
            }
            Err(e) => {
                tracing::warn!(uid = %message.uid, error = %e, "auto-download failed");
            }
        }
    }

    /// Mark an incoming message read and send the read receipt. Repeated
    /// calls are no-ops.
    pub fn mark_incoming_message_read(
        &self,
        message: &mut Message,
        receiver: &Arc<dyn MessageReceiver>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if message.outbox || message.read_at.is_some() || message.is_deleted() {
            return Ok(false);
        }

        message.read_at = Some(at);
        if can_change_to_state(message.state, MessageState::Read) {
            message.state = MessageState::Read;
        }
        message.modified_at = Some(at);
        self.store.update(message)?;
        self.cache.put(message);
        self.events.emit(MessageEvent::Modified(message.clone()));

        if !receiver.no_delivery_receipts() {
            if let Some(api_message_id) = &message.api_message_id {
                if let Err(e) = receiver.send_delivery_receipt(
                    DeliveryReceiptKind::Read,
                    std::slice::from_ref(api_message_id),
                ) {
                    tracing::warn!(error = %e, "failed to send read receipt");
                }
            }
        }
        Ok(true)
    }
}
