//! Blob transport abstraction.
//!
//! Encrypted payloads are uploaded as opaque blobs addressed by id; the
//! engine never hands plaintext to a [`BlobClient`]. The bundled in-memory
//! client is content-addressed by BLAKE3 and mainly serves tests and local
//! operation, but it honors the same progress and cancellation contract a
//! networked client would.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use estafette_shared::constants::MAX_BLOB_SIZE;
use estafette_shared::types::BlobId;

use crate::error::{EngineError, Result};
use crate::registry::CancelToken;

/// Progress callback, invoked with 0..=100. Carries a lifetime so callers
/// can report through closures borrowing their surroundings.
pub type ProgressFn<'a> = dyn Fn(u8) + Send + Sync + 'a;

/// Upload/download transport for encrypted blobs.
pub trait BlobClient: Send + Sync {
    /// Upload a blob and return its id.
    ///
    /// `persist` marks blobs the server must retain until every receiver
    /// fetched them (group sends). Implementations report progress through
    /// `progress` and poll `cancel` between chunks.
    fn upload(
        &self,
        data: &[u8],
        persist: bool,
        progress: &ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<BlobId>;

    fn download(&self, id: &BlobId) -> Result<Vec<u8>>;

    /// Tell the server the blob was consumed and may be dropped.
    fn mark_done(&self, id: &BlobId) -> Result<()>;
}

const UPLOAD_CHUNK_SIZE: usize = 16 * 1024;

/// Content-addressed in-memory blob store.
#[derive(Default)]
pub struct MemoryBlobClient {
    blobs: Mutex<HashMap<BlobId, Vec<u8>>>,
}

impl MemoryBlobClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BlobId, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlobClient for MemoryBlobClient {
    fn upload(
        &self,
        data: &[u8],
        persist: bool,
        progress: &ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<BlobId> {
        if data.is_empty() {
            return Err(EngineError::Transport("refusing to upload empty blob".into()));
        }
        if data.len() > MAX_BLOB_SIZE {
            return Err(EngineError::Transport(format!(
                "blob of {} bytes exceeds maximum of {MAX_BLOB_SIZE}",
                data.len()
            )));
        }

        let id = BlobId(*blake3::hash(data).as_bytes());
        tracing::debug!(blob = %id, size = data.len(), persist, "uploading blob");

        let mut uploaded = 0usize;
        for chunk in data.chunks(UPLOAD_CHUNK_SIZE) {
            if cancel.is_cancelled() {
                tracing::debug!(blob = %id, "upload cancelled");
                return Err(EngineError::Cancelled);
            }
            uploaded += chunk.len();
            progress((uploaded * 100 / data.len()) as u8);
        }

        self.lock().insert(id, data.to_vec());
        Ok(id)
    }

    fn download(&self, id: &BlobId) -> Result<Vec<u8>> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::Transport(format!("blob {id} not found")))
    }

    fn mark_done(&self, id: &BlobId) -> Result<()> {
        self.lock().remove(id);
        Ok(())
    }
}
