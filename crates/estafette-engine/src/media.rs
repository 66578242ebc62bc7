//! Media inputs and the local plaintext repository.
//!
//! A [`MediaItem`] is the caller-supplied description of one attachment to
//! send. The engine keeps the plaintext content of sent and downloaded
//! media in a [`MediaRepository`] so previews and resends never have to
//! fetch and decrypt a blob twice.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use estafette_shared::types::{ContentsKind, MessageKind};
use estafette_store::{FileInfo, RenderingHint};

use crate::error::{EngineError, Result};
use crate::machine::MachineKey;
use crate::registry::CancelToken;

/// Where the plaintext of a media item comes from.
#[derive(Debug, Clone)]
pub enum MediaSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// One attachment (or standalone text) queued for sending.
#[derive(Debug, Clone)]
pub struct MediaItem {
    pub kind: MessageKind,
    pub source: MediaSource,
    pub mime_type: String,
    pub file_name: Option<String>,
    /// For [`MessageKind::Text`] items this is the message text itself.
    pub caption: Option<String>,
    pub rendering: RenderingHint,
    pub duration_secs: Option<f64>,
    /// Pre-rendered thumbnail plaintext, if the caller produced one.
    pub thumbnail: Option<Vec<u8>>,
    /// Whether the item must pass through the video transcoder first.
    pub needs_transcoding: bool,
}

impl MediaItem {
    pub fn file(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::File,
            source: MediaSource::Bytes(data),
            mime_type: mime_type.into(),
            file_name: None,
            caption: None,
            rendering: RenderingHint::File,
            duration_secs: None,
            thumbnail: None,
            needs_transcoding: false,
        }
    }

    pub fn image(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Image,
            rendering: RenderingHint::Media,
            ..Self::file(mime_type, data)
        }
    }

    pub fn video(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Video,
            rendering: RenderingHint::Media,
            needs_transcoding: true,
            ..Self::file(mime_type, data)
        }
    }

    /// A plain text item mixed into a media send. Carries no payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            source: MediaSource::Bytes(Vec::new()),
            mime_type: "text/plain".into(),
            file_name: None,
            caption: Some(text.into()),
            rendering: RenderingHint::File,
            duration_secs: None,
            thumbnail: None,
            needs_transcoding: false,
        }
    }

    pub fn contents_kind(&self) -> ContentsKind {
        match self.kind {
            MessageKind::Text => ContentsKind::Text,
            MessageKind::Image => ContentsKind::Image,
            MessageKind::Video => ContentsKind::Video,
            MessageKind::Audio => ContentsKind::Audio,
            _ => ContentsKind::File,
        }
    }

    /// Build the stored descriptor for this item. Blob ids, key and size
    /// are filled in by the upload steps.
    pub fn build_descriptor(&self) -> FileInfo {
        let mut info = FileInfo::new(self.mime_type.clone());
        info.file_name = self.file_name.clone();
        info.caption = self.caption.clone();
        info.rendering = self.rendering;
        info.duration_secs = self.duration_secs;
        info
    }

    /// Load the plaintext content.
    pub fn load_content(&self) -> Result<Vec<u8>> {
        match &self.source {
            MediaSource::Bytes(data) => Ok(data.clone()),
            MediaSource::Path(path) => {
                let mut data = Vec::new();
                std::fs::File::open(path)
                    .and_then(|mut f| f.read_to_end(&mut data))
                    .map_err(|e| {
                        EngineError::NotFound(format!(
                            "media file {}: {e}",
                            path.display()
                        ))
                    })?;
                Ok(data)
            }
        }
    }
}

/// Result of a transcoding run.
#[derive(Debug)]
pub enum TranscodeOutcome {
    Success(Vec<u8>),
    Failure(String),
    Canceled,
}

/// Re-encodes video payloads to a transportable format.
pub trait VideoTranscoder: Send + Sync {
    fn transcode(&self, item: &MediaItem, cancel: &CancelToken) -> TranscodeOutcome;
}

/// Hands the original bytes through unchanged. Default when no transcoder
/// is wired in.
#[derive(Default)]
pub struct PassthroughTranscoder;

impl VideoTranscoder for PassthroughTranscoder {
    fn transcode(&self, item: &MediaItem, cancel: &CancelToken) -> TranscodeOutcome {
        if cancel.is_cancelled() {
            return TranscodeOutcome::Canceled;
        }
        match item.load_content() {
            Ok(data) => TranscodeOutcome::Success(data),
            Err(e) => TranscodeOutcome::Failure(e.to_string()),
        }
    }
}

/// Local plaintext storage for media payloads, keyed by message identity.
pub trait MediaRepository: Send + Sync {
    fn store_content(&self, key: &MachineKey, data: Vec<u8>) -> Result<()>;
    fn store_thumbnail(&self, key: &MachineKey, data: Vec<u8>) -> Result<()>;
    fn content(&self, key: &MachineKey) -> Option<Vec<u8>>;
    fn thumbnail(&self, key: &MachineKey) -> Option<Vec<u8>>;
    fn remove(&self, key: &MachineKey);
}

#[derive(Default)]
pub struct MemoryMediaRepository {
    inner: Mutex<HashMap<MachineKey, (Option<Vec<u8>>, Option<Vec<u8>>)>>,
}

impl MemoryMediaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<MachineKey, (Option<Vec<u8>>, Option<Vec<u8>>)>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MediaRepository for MemoryMediaRepository {
    fn store_content(&self, key: &MachineKey, data: Vec<u8>) -> Result<()> {
        self.lock().entry(key.clone()).or_default().0 = Some(data);
        Ok(())
    }

    fn store_thumbnail(&self, key: &MachineKey, data: Vec<u8>) -> Result<()> {
        self.lock().entry(key.clone()).or_default().1 = Some(data);
        Ok(())
    }

    fn content(&self, key: &MachineKey) -> Option<Vec<u8>> {
        self.lock().get(key).and_then(|(c, _)| c.clone())
    }

    fn thumbnail(&self, key: &MachineKey) -> Option<Vec<u8>> {
        self.lock().get(key).and_then(|(_, t)| t.clone())
    }

    fn remove(&self, key: &MachineKey) {
        self.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estafette_shared::types::ConversationScope;

    fn key(uid: &str) -> MachineKey {
        MachineKey {
            scope: ConversationScope::Contact,
            uid: uid.into(),
        }
    }

    #[test]
    fn repository_stores_content_and_thumbnail_separately() {
        let repo = MemoryMediaRepository::new();
        repo.store_content(&key("u1"), vec![1, 2, 3]).unwrap();
        repo.store_thumbnail(&key("u1"), vec![9]).unwrap();

        assert_eq!(repo.content(&key("u1")), Some(vec![1, 2, 3]));
        assert_eq!(repo.thumbnail(&key("u1")), Some(vec![9]));
        assert_eq!(repo.content(&key("u2")), None);

        repo.remove(&key("u1"));
        assert_eq!(repo.content(&key("u1")), None);
    }

    #[test]
    fn passthrough_honors_cancellation() {
        let transcoder = PassthroughTranscoder;
        let item = MediaItem::video("video/mp4", vec![0u8; 16]);

        let cancel = CancelToken::new();
        assert!(matches!(
            transcoder.transcode(&item, &cancel),
            TranscodeOutcome::Success(ref d) if d.len() == 16
        ));

        cancel.cancel();
        assert!(matches!(
            transcoder.transcode(&item, &cancel),
            TranscodeOutcome::Canceled
        ));
    }

    #[test]
    fn missing_path_is_a_failure() {
        let mut item = MediaItem::file("application/octet-stream", Vec::new());
        item.source = MediaSource::Path(PathBuf::from("/nonexistent/spool/file.bin"));
        assert!(item.load_content().is_err());
    }

    #[test]
    fn descriptor_carries_item_metadata() {
        let mut item = MediaItem::image("image/jpeg", vec![0xFF, 0xD8]);
        item.file_name = Some("photo.jpg".into());
        item.caption = Some("view from the office".into());

        let info = item.build_descriptor();
        assert_eq!(info.mime_type, "image/jpeg");
        assert_eq!(info.file_name.as_deref(), Some("photo.jpg"));
        assert_eq!(info.rendering, RenderingHint::Media);
        assert!(info.blob_id.is_none());
    }
}
