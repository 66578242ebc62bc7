//! Outgoing message pipelines.
//!
//! Text, location and ballot messages go out in one transmit step. Media
//! messages run through a per-receiver [`SendMachine`]: mark uploading,
//! upload the content blob, upload the thumbnail blob, send the descriptor
//! envelope, finalize. Encryption and blob uploads are shared across the
//! per-receiver copies of one fan-out send, so the payload is encrypted
//! and uploaded exactly once no matter how many destinations a
//! distribution list expands into.
//!
//! [`SendMachine`]: crate::machine::SendMachine

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use estafette_shared::constants::{
    BOX_OVERHEAD, DELETE_MESSAGES_MAX_AGE_SECS, EDIT_MESSAGES_MAX_AGE_SECS, FILE_NONCE,
    MAX_TEXT_MESSAGE_LEN, THUMBNAIL_NONCE,
};
use estafette_shared::crypto::{
    encrypt_in_place, encrypt_with_nonce, generate_symmetric_key, SymmetricKey,
};
use estafette_shared::error::CryptoError;
use estafette_shared::types::{BlobId, ContentsKind, ConversationRef, MessageKind, MessageState};
use estafette_store::{BallotRef, LocationInfo, Message, MessageBody, RenderingHint, TextBody};

use crate::error::{EngineError, Result, ValidationError};
use crate::events::MessageEvent;
use crate::machine::MachineKey;
use crate::media::{MediaItem, MediaSource, TranscodeOutcome};
use crate::receiver::{resolve_receivers, MessageReceiver};
use crate::service::MessageService;

/// Encryption and upload results shared by the per-receiver copies of one
/// media send. Filled lazily by whichever machine gets there first.
#[derive(Default)]
pub(crate) struct SharedEncrypt {
    key: Option<SymmetricKey>,
    content: Option<Vec<u8>>,
    content_blob: Option<BlobId>,
    thumbnail: Option<Vec<u8>>,
    thumbnail_blob: Option<BlobId>,
}

impl SharedEncrypt {
    /// Seed from an existing message so a resumed send reuses the key and
    /// already-uploaded blobs instead of producing new ones.
    fn seed_from(message: &Message) -> Result<Self> {
        let mut shared = Self::default();
        if let Some(info) = message.file_info() {
            if let Some(hex_key) = &info.encryption_key {
                shared.key = Some(key_from_hex(hex_key)?);
            }
            shared.content_blob = info.blob_id;
            shared.thumbnail_blob = info.thumbnail_blob_id;
        }
        Ok(shared)
    }
}

pub(crate) fn key_from_hex(s: &str) -> Result<SymmetricKey> {
    hex::decode(s)
        .ok()
        .and_then(|bytes| SymmetricKey::try_from(bytes).ok())
        .ok_or(EngineError::Crypto(CryptoError::InvalidKeyLength))
}

fn validate_text(text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(ValidationError::EmptyText.into());
    }
    if text.len() > MAX_TEXT_MESSAGE_LEN {
        return Err(ValidationError::TextTooLong {
            size: text.len(),
            max: MAX_TEXT_MESSAGE_LEN,
        }
        .into());
    }
    Ok(())
}

fn check_age_window(message: &Message, max_age_secs: i64, now: DateTime<Utc>) -> Result<()> {
    let posted_at = message.posted_at.ok_or(ValidationError::NeverPosted)?;
    if now.signed_duration_since(posted_at).num_seconds() > max_age_secs {
        return Err(ValidationError::WindowExpired(max_age_secs).into());
    }
    Ok(())
}

impl MessageService {
    /// Send a text message. The text is trimmed first; empty or oversized
    /// texts are rejected before any row is created.
    pub fn send_text(&self, receiver: &Arc<dyn MessageReceiver>, text: &str) -> Result<Message> {
        self.send_text_quoting(receiver, text, None)
    }

    /// Like [`send_text`], quoting another message by its wire id.
    ///
    /// [`send_text`]: MessageService::send_text
    pub fn send_text_quoting(
        &self,
        receiver: &Arc<dyn MessageReceiver>,
        text: &str,
        quoted_api_message_id: Option<String>,
    ) -> Result<Message> {
        let trimmed = text.trim();
        validate_text(trimmed)?;

        let now = Utc::now();
        let mut message = Message::new(
            receiver.conversation(),
            MessageKind::Text,
            ContentsKind::Text,
            true,
            now,
        );
        message.body = MessageBody::Text(TextBody {
            text: trimmed.to_string(),
            quoted_api_message_id,
        });
        message.state = MessageState::Sending;
        message.saved = true;

        let mut message = self.store.create(&message)?;
        self.cache.put(&message);
        self.events.emit(MessageEvent::Created(message.clone()));
        tracing::info!(uid = %message.uid, to = %receiver.display_name(), "sending text message");

        self.transmit_simple(&mut message, receiver)?;
        Ok(message)
    }

    pub fn send_location(
        &self,
        receiver: &Arc<dyn MessageReceiver>,
        location: LocationInfo,
    ) -> Result<Message> {
        let now = Utc::now();
        let mut message = Message::new(
            receiver.conversation(),
            MessageKind::Location,
            ContentsKind::Location,
            true,
            now,
        );
        message.body = MessageBody::Location(location);
        message.state = MessageState::Sending;
        message.saved = true;

        let mut message = self.store.create(&message)?;
        self.cache.put(&message);
        self.events.emit(MessageEvent::Created(message.clone()));

        self.transmit_simple(&mut message, receiver)?;
        Ok(message)
    }

    pub fn send_ballot_message(
        &self,
        receiver: &Arc<dyn MessageReceiver>,
        ballot: BallotRef,
    ) -> Result<Message> {
        let now = Utc::now();
        let mut message = Message::new(
            receiver.conversation(),
            MessageKind::Ballot,
            ContentsKind::Ballot,
            true,
            now,
        );
        message.body = MessageBody::Ballot(ballot);
        message.state = MessageState::Sending;
        message.saved = true;

        let mut message = self.store.create(&message)?;
        self.cache.put(&message);
        self.events.emit(MessageEvent::Created(message.clone()));

        self.transmit_simple(&mut message, receiver)?;
        Ok(message)
    }

    /// Hand a single-step message to the transport, retrying transient
    /// failures per the retry policy, and finalize its state.
    pub(crate) fn transmit_simple(
        &self,
        message: &mut Message,
        receiver: &Arc<dyn MessageReceiver>,
    ) -> Result<()> {
        let outcome = self.retry.run(|| match &message.body {
            MessageBody::Text(t) => receiver.send_text(message, &t.text),
            MessageBody::Location(l) => receiver.send_location(message, l),
            MessageBody::Ballot(b) => receiver.send_ballot(message, b),
            _ => Err(EngineError::NotFound(
                "message body has no single-step transmit".into(),
            )),
        });

        match outcome {
            Ok(api_message_id) => {
                message.api_message_id = Some(api_message_id);
                self.update_outgoing_message_state(message, MessageState::Sent, Utc::now())?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(uid = %message.uid, error = %e, "transmit failed");
                let failed = if matches!(e, EngineError::Security(_)) {
                    MessageState::FsKeyMismatch
                } else {
                    MessageState::SendFailed
                };
                self.update_outgoing_message_state(message, failed, Utc::now())?;
                Err(e)
            }
        }
    }

    /// Edit the text of an already-sent message, within the edit window.
    /// The envelope goes out first; only an accepted edit is persisted.
    pub fn send_edited_message_text(
        &self,
        message: &mut Message,
        new_text: &str,
        receiver: &Arc<dyn MessageReceiver>,
    ) -> Result<()> {
        if !message.outbox {
            return Err(ValidationError::NotOutgoing.into());
        }
        if message.is_deleted() {
            return Err(ValidationError::MessageDeleted.into());
        }
        let now = Utc::now();
        check_age_window(message, EDIT_MESSAGES_MAX_AGE_SECS, now)?;

        let trimmed = new_text.trim();
        validate_text(trimmed)?;
        if message.text() == Some(trimmed) {
            return Ok(());
        }
        let api_message_id = message
            .api_message_id
            .clone()
            .ok_or(ValidationError::NeverPosted)?;

        receiver.send_edit_envelope(&api_message_id, trimmed)?;

        let former = message.text().map(str::to_owned);
        self.store
            .add_message_edit(message.id, former.as_deref(), now)?;

        match &mut message.body {
            MessageBody::Text(t) => t.text = trimmed.to_string(),
            // captions of media messages are editable too
            MessageBody::Media(f) => f.caption = Some(trimmed.to_string()),
            _ => {
                return Err(EngineError::NotFound(
                    "message body carries no editable text".into(),
                ))
            }
        }
        message.edited_at = Some(now);
        message.modified_at = Some(now);
        self.store.update(message)?;
        self.cache.put(message);
        self.events.emit(MessageEvent::Edited(message.clone()));
        Ok(())
    }

    /// Delete a sent message for all receivers, within the delete window.
    /// The row survives as a tombstone with its payload scrubbed.
    pub fn send_delete_message(
        &self,
        message: &mut Message,
        receiver: &Arc<dyn MessageReceiver>,
    ) -> Result<()> {
        if !message.outbox {
            return Err(ValidationError::NotOutgoing.into());
        }
        if message.is_deleted() {
            return Err(ValidationError::MessageDeleted.into());
        }
        let now = Utc::now();
        check_age_window(message, DELETE_MESSAGES_MAX_AGE_SECS, now)?;
        let api_message_id = message
            .api_message_id
            .clone()
            .ok_or(ValidationError::NeverPosted)?;

        receiver.send_delete_envelope(&api_message_id)?;

        message.body = MessageBody::Text(TextBody::default());
        message.deleted_at = Some(now);
        message.edited_at = None;
        message.modified_at = Some(now);
        self.store.update(message)?;
        self.store.remove_reactions_for_message(message.id)?;
        self.store.remove_edits_for_message(message.id)?;
        self.media.remove(&MachineKey::for_message(message));
        self.cache.put(message);
        self.events.emit(MessageEvent::DeletedForAll(message.clone()));
        Ok(())
    }

    /// Send a batch of media items (and interleaved text items) to a
    /// receiver, fanning out distribution lists into per-member copies.
    ///
    /// Returns the messages that reached a final state, sent or failed.
    /// Cancelled items leave no trace and are not errors; items that
    /// failed for one receiver keep their row in the failed state so the
    /// user can resend.
    pub fn send_media(
        &self,
        receiver: Arc<dyn MessageReceiver>,
        items: Vec<MediaItem>,
    ) -> Result<Vec<Message>> {
        let receivers = resolve_receivers(receiver);
        let mut results = Vec::new();

        for item in items {
            if item.kind == MessageKind::Text {
                let Some(text) = item.caption.as_deref() else {
                    tracing::warn!("skipping text item without text");
                    continue;
                };
                for receiver in &receivers {
                    match self.send_text(receiver, text) {
                        Ok(message) => results.push(message),
                        Err(e) => tracing::warn!(error = %e, "text item failed"),
                    }
                }
                continue;
            }
            self.send_media_item(&receivers, item, &mut results)?;
        }
        Ok(results)
    }

    /// Spawn [`send_media`] on a worker thread.
    ///
    /// [`send_media`]: MessageService::send_media
    pub fn send_media_async(
        self: &Arc<Self>,
        receiver: Arc<dyn MessageReceiver>,
        items: Vec<MediaItem>,
    ) -> std::thread::JoinHandle<Result<Vec<Message>>> {
        let service = Arc::clone(self);
        std::thread::spawn(move || service.send_media(receiver, items))
    }

    fn send_media_item(
        &self,
        receivers: &[Arc<dyn MessageReceiver>],
        item: MediaItem,
        results: &mut Vec<Message>,
    ) -> Result<()> {
        let correlation_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        // One row per destination, visible immediately as pending.
        let mut rows = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            let mut message = Message::new(
                receiver.conversation(),
                item.kind,
                item.contents_kind(),
                true,
                now,
            );
            message.body = MessageBody::Media(item.build_descriptor());
            message.correlation_id = Some(correlation_id.clone());

            let message = self.store.create(&message)?;
            self.cache.put(&message);
            self.events.emit(MessageEvent::Created(message.clone()));
            rows.push(message);
        }

        // Keep thumbnail plaintext for previews before any network work.
        if let Some(thumbnail) = &item.thumbnail {
            for message in &rows {
                self.media
                    .store_thumbnail(&MachineKey::for_message(message), thumbnail.clone())?;
            }
        }

        let mut payload = None;
        if item.needs_transcoding {
            match self.transcode_item(&item, &mut rows)? {
                Some(data) => payload = Some(data),
                // cancelled or failed; rows already handled
                None => {
                    results.extend(rows);
                    return Ok(());
                }
            }
        }

        let plaintext = match payload.map(Ok).unwrap_or_else(|| item.load_content()) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "media payload unavailable");
                for message in &mut rows {
                    self.update_outgoing_message_state(
                        message,
                        MessageState::SendFailed,
                        Utc::now(),
                    )?;
                    results.push(message.clone());
                }
                return Ok(());
            }
        };

        for message in &rows {
            self.media
                .store_content(&MachineKey::for_message(message), plaintext.clone())?;
        }

        let shared = Mutex::new(SharedEncrypt::default());
        for (message, receiver) in rows.iter_mut().zip(receivers) {
            match self.run_media_pipeline(message, receiver, &item, &plaintext, &shared) {
                Ok(()) => results.push(message.clone()),
                Err(e) if e.is_cancelled() => {
                    self.discard_send(message);
                }
                Err(e) => {
                    tracing::warn!(uid = %message.uid, error = %e, "media send failed");
                    let failed = if matches!(e, EngineError::Security(_)) {
                        MessageState::FsKeyMismatch
                    } else {
                        MessageState::SendFailed
                    };
                    self.update_outgoing_message_state(message, failed, Utc::now())?;
                    // machine stays registered so a resend resumes where
                    // this attempt stopped
                    results.push(message.clone());
                }
            }
        }
        Ok(())
    }

    /// Transcode once per item. Returns `None` when the run did not yield
    /// a payload; cancelled rows have been removed, failed rows marked.
    fn transcode_item(
        &self,
        item: &MediaItem,
        rows: &mut Vec<Message>,
    ) -> Result<Option<Vec<u8>>> {
        let token_key = MachineKey::for_message(&rows[0]);
        let cancel = self.cancellations.register(&token_key);

        for message in rows.iter_mut() {
            self.update_outgoing_message_state(message, MessageState::Transcoding, Utc::now())?;
        }

        let outcome = self.transcoder.transcode(item, &cancel);
        self.cancellations.release(&token_key);

        match outcome {
            TranscodeOutcome::Success(data) => Ok(Some(data)),
            TranscodeOutcome::Canceled => {
                tracing::info!("transcoding cancelled");
                for message in rows.iter() {
                    self.discard_send(message);
                }
                rows.clear();
                Ok(None)
            }
            TranscodeOutcome::Failure(reason) => {
                tracing::warn!(reason, "transcoding failed");
                for message in rows.iter_mut() {
                    self.update_outgoing_message_state(
                        message,
                        MessageState::SendFailed,
                        Utc::now(),
                    )?;
                }
                Ok(None)
            }
        }
    }

    /// Run the five-step send machine for one message copy.
    pub(crate) fn run_media_pipeline(
        &self,
        message: &mut Message,
        receiver: &Arc<dyn MessageReceiver>,
        item: &MediaItem,
        plaintext: &[u8],
        shared: &Mutex<SharedEncrypt>,
    ) -> Result<()> {
        let key = MachineKey::for_message(message);
        let machine = self.machines.get_or_create(&key);
        let cancel = self.cancellations.register(&key);
        // group blobs stay on the server until every member fetched them
        let persist = matches!(message.conversation, ConversationRef::Group(_));

        let mut machine = machine.lock().unwrap_or_else(PoisonError::into_inner);
        machine.reset();

        // 1: key setup and uploading state
        machine.next(|| {
            let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
            let content_key = *shared.key.get_or_insert_with(generate_symmetric_key);
            if let Some(info) = message.file_info_mut() {
                info.encryption_key = Some(hex::encode(content_key));
                info.file_size = plaintext.len() as u64;
            }
            self.update_outgoing_message_state(message, MessageState::Uploading, Utc::now())?;
            Ok(())
        })?;

        // 2: encrypt and upload the content blob, once per item
        machine.next(|| {
            let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.content_blob.is_none() {
                let content_key = shared
                    .key
                    .ok_or(EngineError::Crypto(CryptoError::InvalidKeyLength))?;
                let ciphertext = match shared.content.clone() {
                    Some(data) => data,
                    None => {
                        let mut data = Vec::with_capacity(plaintext.len() + BOX_OVERHEAD);
                        data.extend_from_slice(plaintext);
                        encrypt_in_place(&content_key, &FILE_NONCE, &mut data)?;
                        shared.content = Some(data.clone());
                        data
                    }
                };
                let uid = message.uid.clone();
                let progress = |p: u8| {
                    self.events.emit(MessageEvent::ProgressChanged {
                        uid: uid.clone(),
                        progress: p,
                    })
                };
                shared.content_blob =
                    Some(self.blobs.upload(&ciphertext, persist, &progress, &cancel)?);
            }
            if let Some(info) = message.file_info_mut() {
                info.blob_id = shared.content_blob;
            }
            Ok(())
        })?;

        // 3: encrypt and upload the thumbnail blob, same key, distinct nonce
        machine.next(|| {
            let Some(thumbnail) = item.thumbnail.as_deref() else {
                return Ok(());
            };
            if !message.kind.can_have_thumbnail() {
                return Ok(());
            }
            let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.thumbnail_blob.is_none() {
                let content_key = shared
                    .key
                    .ok_or(EngineError::Crypto(CryptoError::InvalidKeyLength))?;
                let ciphertext = match shared.thumbnail.clone() {
                    Some(data) => data,
                    None => {
                        let data =
                            encrypt_with_nonce(&content_key, &THUMBNAIL_NONCE, thumbnail)?;
                        shared.thumbnail = Some(data.clone());
                        data
                    }
                };
                let silent = |_p: u8| {};
                shared.thumbnail_blob =
                    Some(self.blobs.upload(&ciphertext, persist, &silent, &cancel)?);
            }
            if let Some(info) = message.file_info_mut() {
                info.thumbnail_blob_id = shared.thumbnail_blob;
            }
            Ok(())
        })?;

        // 4: descriptor envelope
        machine.next(|| {
            let info = message
                .file_info()
                .cloned()
                .ok_or_else(|| EngineError::NotFound("message has no file descriptor".into()))?;
            let api_message_id = receiver.send_file_envelope(message, &info)?;
            message.api_message_id = Some(api_message_id);

            let target = if receiver.offer_retry() && receiver.send_media_data() {
                MessageState::Sending
            } else {
                MessageState::Sent
            };
            let now = Utc::now();
            if message.posted_at.is_none() {
                message.posted_at = Some(now);
            }
            self.update_outgoing_message_state(message, target, now)?;
            Ok(())
        })?;

        // 5: finalize
        machine.next(|| {
            message.saved = true;
            message.modified_at = Some(Utc::now());
            self.store.update(message)?;
            self.cache.put(message);
            self.events.emit(MessageEvent::Modified(message.clone()));
            Ok(())
        })?;

        drop(machine);
        self.machines.discard(&key);
        self.cancellations.release(&key);
        Ok(())
    }

    /// Cancel an in-flight send and remove every trace of the message.
    ///
    /// Completed sends cannot be cancelled; deleting those goes through
    /// [`send_delete_message`].
    ///
    /// [`send_delete_message`]: MessageService::send_delete_message
    pub fn cancel_message_send(&self, uid: &str) -> Result<bool> {
        let message = match self.store.by_uid(uid) {
            Ok(message) => message,
            Err(estafette_store::StoreError::NotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !message.outbox || message.saved {
            return Ok(false);
        }

        tracing::info!(uid, "cancelling message send");
        let key = MachineKey::for_message(&message);
        self.cancellations.cancel(&key);
        self.discard_send(&message);
        Ok(true)
    }

    /// Cancel a running video transcode. Same cleanup as cancelling the
    /// upload: the pending row disappears.
    pub fn cancel_video_transcoding(&self, uid: &str) -> Result<bool> {
        self.cancel_message_send(uid)
    }

    /// Remove a never-completed send: row, cache entry, machine,
    /// cancellation handle and spooled media.
    pub(crate) fn discard_send(&self, message: &Message) {
        let key = MachineKey::for_message(message);
        self.machines.remove(&key);
        self.cancellations.cancel(&key);
        self.media.remove(&key);
        self.cache.invalidate(key.scope, &key.uid);
        match self.store.delete(message.id) {
            Ok(_) => {}
            Err(e) => tracing::warn!(uid = %message.uid, error = %e, "failed to delete row"),
        }
        self.events.emit(MessageEvent::Removed {
            conversation: message.conversation.clone(),
            uid: message.uid.clone(),
        });
    }

    pub(crate) fn resend_media_message(
        &self,
        message: &mut Message,
        receiver: &Arc<dyn MessageReceiver>,
    ) -> Result<()> {
        let key = MachineKey::for_message(message);
        let plaintext = self.media.content(&key).ok_or_else(|| {
            EngineError::NotFound("media payload no longer available locally".into())
        })?;
        let thumbnail = self.media.thumbnail(&key);

        let item = MediaItem {
            kind: message.kind,
            source: MediaSource::Bytes(Vec::new()),
            mime_type: message
                .file_info()
                .map(|i| i.mime_type.clone())
                .unwrap_or_else(|| "application/octet-stream".into()),
            file_name: message.file_info().and_then(|i| i.file_name.clone()),
            caption: message.file_info().and_then(|i| i.caption.clone()),
            rendering: message
                .file_info()
                .map(|i| i.rendering)
                .unwrap_or(RenderingHint::File),
            duration_secs: message.file_info().and_then(|i| i.duration_secs),
            thumbnail,
            needs_transcoding: false,
        };

        let shared = Mutex::new(SharedEncrypt::seed_from(message)?);
        match self.run_media_pipeline(message, receiver, &item, &plaintext, &shared) {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => {
                self.discard_send(message);
                Err(e)
            }
            Err(e) => {
                let failed = if matches!(e, EngineError::Security(_)) {
                    MessageState::FsKeyMismatch
                } else {
                    MessageState::SendFailed
                };
                self.update_outgoing_message_state(message, failed, Utc::now())?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{service_with_blocking_blobs, service_with_receiver, StubReceiver};
    use estafette_shared::constants::BOX_OVERHEAD;
    use estafette_shared::crypto::decrypt_with_nonce;

    #[test]
    fn hello_scenario_emits_created_then_modified() {
        let (svc, stub) = service_with_receiver();
        let receiver: Arc<dyn MessageReceiver> = stub;
        let mut events = svc.subscribe();

        let message = svc.send_text(&receiver, "hello").unwrap();
        assert_eq!(message.state, MessageState::Sent);
        assert_eq!(message.text(), Some("hello"));
        assert!(message.api_message_id.is_some());
        assert!(message.posted_at.unwrap() >= message.created_at);
        assert!(message.saved);

        match events.try_recv().unwrap() {
            MessageEvent::Created(m) => assert_eq!(m.state, MessageState::Sending),
            other => panic!("expected created, got {other:?}"),
        }
        match events.try_recv().unwrap() {
            MessageEvent::Modified(m) => assert_eq!(m.state, MessageState::Sent),
            other => panic!("expected modified, got {other:?}"),
        }
        assert!(events.try_recv().is_err(), "no further events expected");
    }

    #[test]
    fn empty_and_whitespace_text_rejected_without_row() {
        let (svc, stub) = service_with_receiver();
        let receiver: Arc<dyn MessageReceiver> = stub;

        for text in ["", "   ", "\n\t"] {
            let err = svc.send_text(&receiver, text).unwrap_err();
            assert!(matches!(
                err,
                EngineError::Validation(ValidationError::EmptyText)
            ));
        }
        assert!(svc.cache().is_empty());
    }

    #[test]
    fn oversized_text_rejected_but_boundary_accepted() {
        let (svc, stub) = service_with_receiver();
        let receiver: Arc<dyn MessageReceiver> = stub;

        let text = "x".repeat(MAX_TEXT_MESSAGE_LEN + 1);
        let err = svc.send_text(&receiver, &text).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::TextTooLong { .. })
        ));

        let text = "x".repeat(MAX_TEXT_MESSAGE_LEN);
        assert!(svc.send_text(&receiver, &text).is_ok());
    }

    #[test]
    fn failed_text_send_ends_in_send_failed() {
        let (svc, stub) = service_with_receiver();
        stub.fail_next_sends(usize::MAX);
        let receiver: Arc<dyn MessageReceiver> = stub;
        let mut events = svc.subscribe();

        let err = svc.send_text(&receiver, "hello").unwrap_err();
        assert!(err.is_transport());

        let uid = match events.try_recv().unwrap() {
            MessageEvent::Created(m) => m.uid,
            other => panic!("expected created, got {other:?}"),
        };
        let stored = svc.store.by_uid(&uid).unwrap();
        assert_eq!(stored.state, MessageState::SendFailed);
        assert!(stored.state.is_resendable());
    }

    #[test]
    fn transient_failure_is_retried() {
        let (svc, stub) = service_with_receiver();
        stub.fail_next_sends(1);
        let receiver: Arc<dyn MessageReceiver> = stub;

        let message = svc.send_text(&receiver, "hello").unwrap();
        assert_eq!(message.state, MessageState::Sent);
    }

    #[test]
    fn media_send_encrypts_and_uploads_both_blobs() {
        let (svc, stub) = service_with_receiver();
        let receiver: Arc<dyn MessageReceiver> = stub;

        let mut item = MediaItem::image("image/jpeg", b"jpeg bytes".to_vec());
        item.thumbnail = Some(b"thumb bytes".to_vec());
        let sent = svc.send_media(receiver, vec![item]).unwrap();
        assert_eq!(sent.len(), 1);

        let message = &sent[0];
        assert!(message.saved);
        let info = message.file_info().unwrap();
        assert_eq!(info.file_size, b"jpeg bytes".len() as u64);
        let blob_id = info.blob_id.unwrap();
        let thumb_id = info.thumbnail_blob_id.unwrap();
        assert_ne!(blob_id, thumb_id);

        // both blobs decrypt under the stored key with their class nonce
        let key = key_from_hex(info.encryption_key.as_ref().unwrap()).unwrap();
        let content = svc.blobs.download(&blob_id).unwrap();
        assert_eq!(content.len(), b"jpeg bytes".len() + BOX_OVERHEAD);
        assert_eq!(
            decrypt_with_nonce(&key, &FILE_NONCE, &content).unwrap(),
            b"jpeg bytes"
        );
        let thumb = svc.blobs.download(&thumb_id).unwrap();
        assert_eq!(
            decrypt_with_nonce(&key, &THUMBNAIL_NONCE, &thumb).unwrap(),
            b"thumb bytes"
        );

        // pipeline finished, nothing stays in flight
        assert_eq!(svc.in_flight(), 0);
    }

    #[test]
    fn list_fan_out_uploads_once_and_correlates_rows() {
        let (svc, _stub) = service_with_receiver();
        let members: Vec<Arc<dyn MessageReceiver>> = vec![
            Arc::new(StubReceiver::contact("PEER0001")),
            Arc::new(StubReceiver::contact("PEER0002")),
            Arc::new(StubReceiver::contact("PEER0003")),
        ];
        let list: Arc<dyn MessageReceiver> = Arc::new(StubReceiver::list(7, members));

        let item = MediaItem::file("application/pdf", vec![0x25, 0x50, 0x44, 0x46]);
        let sent = svc.send_media(list, vec![item]).unwrap();
        assert_eq!(sent.len(), 3);

        let correlation = sent[0].correlation_id.clone().unwrap();
        let blob = sent[0].file_info().unwrap().blob_id.unwrap();
        let key = sent[0].file_info().unwrap().encryption_key.clone().unwrap();
        for message in &sent[1..] {
            assert_eq!(
                message.correlation_id.as_deref(),
                Some(correlation.as_str())
            );
            let info = message.file_info().unwrap();
            assert_eq!(info.blob_id, Some(blob));
            assert_eq!(info.encryption_key.as_deref(), Some(key.as_str()));
        }
    }

    #[test]
    fn edit_window_boundary() {
        let (svc, stub) = service_with_receiver();
        let receiver: Arc<dyn MessageReceiver> = stub;
        let mut message = svc.send_text(&receiver, "first").unwrap();

        // just inside the window
        message.posted_at =
            Some(Utc::now() - chrono::Duration::seconds(EDIT_MESSAGES_MAX_AGE_SECS - 1));
        svc.store.update(&message).unwrap();
        svc.send_edited_message_text(&mut message, "second", &receiver)
            .unwrap();
        assert_eq!(message.text(), Some("second"));
        assert!(message.edited_at.is_some());

        let edits = svc.store.edits_for_message(message.id).unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].former_text.as_deref(), Some("first"));

        // just outside
        message.posted_at =
            Some(Utc::now() - chrono::Duration::seconds(EDIT_MESSAGES_MAX_AGE_SECS + 1));
        svc.store.update(&message).unwrap();
        let err = svc
            .send_edited_message_text(&mut message, "third", &receiver)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::WindowExpired(_))
        ));
        assert_eq!(message.text(), Some("second"));
    }

    #[test]
    fn delete_for_all_scrubs_payload_and_keeps_tombstone() {
        let (svc, stub) = service_with_receiver();
        let receiver: Arc<dyn MessageReceiver> = stub;
        let mut message = svc.send_text(&receiver, "regrettable").unwrap();
        svc.apply_message_reaction(
            &mut message,
            "PEER0001",
            estafette_shared::constants::REACTION_ACKNOWLEDGE,
            Utc::now(),
        )
        .unwrap();

        svc.send_delete_message(&mut message, &receiver).unwrap();

        let stored = svc.store.by_uid(&message.uid).unwrap();
        assert!(stored.is_deleted());
        assert_eq!(stored.text(), Some(""));
        assert!(svc
            .store
            .reactions_for_message(stored.id)
            .unwrap()
            .is_empty());

        // tombstones accept no further edits
        let err = svc
            .send_edited_message_text(&mut message, "resurrect", &receiver)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::MessageDeleted)
        ));
    }

    #[test]
    fn never_posted_message_cannot_be_edited_or_deleted() {
        let (svc, stub) = service_with_receiver();
        stub.fail_next_sends(usize::MAX);
        let receiver: Arc<dyn MessageReceiver> = stub;
        let mut events = svc.subscribe();

        let _ = svc.send_text(&receiver, "stuck");
        let uid = match events.try_recv().unwrap() {
            MessageEvent::Created(m) => m.uid,
            other => panic!("expected created, got {other:?}"),
        };
        let mut message = svc.store.by_uid(&uid).unwrap();

        for result in [
            svc.send_edited_message_text(&mut message, "edited", &receiver),
            svc.send_delete_message(&mut message, &receiver),
        ] {
            assert!(matches!(
                result.unwrap_err(),
                EngineError::Validation(ValidationError::NeverPosted)
            ));
        }
    }

    #[test]
    fn cancel_mid_upload_leaves_no_trace() {
        use std::time::Duration;

        let (svc, stub) = service_with_blocking_blobs();
        let receiver: Arc<dyn MessageReceiver> = stub;
        let svc = Arc::new(svc);
        let mut events = svc.subscribe();

        let item = MediaItem::image("image/png", vec![0u8; 4096]);
        let handle = svc.send_media_async(receiver, vec![item]);

        // wait for the pending row to appear
        let uid = loop {
            match events.try_recv() {
                Ok(MessageEvent::Created(m)) => break m.uid,
                _ => std::thread::sleep(Duration::from_millis(5)),
            }
        };
        // and for the upload to be in flight
        while svc.in_flight() == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(svc.cancel_message_send(&uid).unwrap());
        let sent = handle.join().unwrap().unwrap();
        assert!(sent.is_empty());

        assert!(matches!(
            svc.store.by_uid(&uid),
            Err(estafette_store::StoreError::NotFound)
        ));
        assert_eq!(svc.in_flight(), 0);
        assert!(svc.cache().is_empty());
    }

    #[test]
    fn cancel_completed_send_is_refused() {
        let (svc, stub) = service_with_receiver();
        let receiver: Arc<dyn MessageReceiver> = stub;
        let message = svc.send_text(&receiver, "done").unwrap();

        assert!(!svc.cancel_message_send(&message.uid).unwrap());
        assert!(svc.store.by_uid(&message.uid).is_ok());
    }
}
