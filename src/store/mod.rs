//! Chunk store: append-only byte storage per upload, plus the move into
//! permanent storage once an upload is finalized.

pub mod filesystem;
pub mod memory;
pub mod remote;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::models::{UploadId, UploadSession};

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
pub use remote::RemoteStore;
pub use s3::S3Store;

/// Maximum range size for a single read (128 MiB).
pub const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// Piece size when a download is streamed through buffered range reads.
pub const STREAM_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Streamed download body.
pub type ByteStream = Pin<Box<dyn Stream<Item = StoreResult<Bytes>> + Send>>;

/// What a streamed read targets.
#[derive(Clone, Debug)]
pub enum ReadTarget {
    /// an upload still in the cache stage
    Upload(UploadId),
    /// a finalized upload in permanent storage
    Stored(StoredBlob),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no stored bytes for {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("append at offset {expected} but write position is {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// a finished upload in permanent storage
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlob {
    /// backend-specific permanent identity (file name, object key or url)
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Reserve an empty entry for a new upload.
    async fn create(&self, id: &UploadId, length: Option<u64>) -> StoreResult<()>;

    /// Append `data` at `expected_offset`, which must equal the current write
    /// position. Returns the new write position. A failed append leaves the
    /// write position unchanged.
    async fn append(&self, id: &UploadId, expected_offset: u64, data: Bytes) -> StoreResult<u64>;

    /// Current write position.
    async fn position(&self, id: &UploadId) -> StoreResult<u64>;

    /// Record a length that was deferred at creation.
    async fn declare_length(&self, _id: &UploadId, _length: u64) -> StoreResult<()> {
        Ok(())
    }

    /// Read `[start, end)` of an upload still in progress.
    async fn read_range(&self, id: &UploadId, start: u64, end: u64) -> StoreResult<Bytes>;

    /// Move the finished bytes under `key` in permanent storage, avoiding a
    /// copy where the backend can.
    async fn promote(&self, id: &UploadId, key: &str) -> StoreResult<StoredBlob>;

    /// Read `[start, end)` of a promoted blob.
    async fn read_stored(&self, blob: &StoredBlob, start: u64, end: u64) -> StoreResult<Bytes>;

    /// Open `[start, end)` as a stream without buffering it. `None` means the
    /// backend has no native streaming and the caller should fall back to
    /// [`stream_range`].
    async fn open_stream(
        &self,
        _target: &ReadTarget,
        _start: u64,
        _end: u64,
    ) -> StoreResult<Option<ByteStream>> {
        Ok(None)
    }

    /// Remove an in-progress entry and any persisted session record. Missing
    /// entries are not an error.
    async fn delete(&self, id: &UploadId) -> StoreResult<()>;

    /// Remove a promoted blob. Missing blobs are not an error.
    async fn delete_stored(&self, blob: &StoredBlob) -> StoreResult<()>;

    /// Static identifier used in logs and stats.
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable before serving traffic.
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Persist session bookkeeping next to the bytes. Backends that keep
    /// nothing across restarts ignore it.
    async fn save_session(&self, _session: &UploadSession) -> StoreResult<()> {
        Ok(())
    }

    /// Every session record persisted by [`ChunkStore::save_session`].
    async fn load_sessions(&self) -> StoreResult<Vec<UploadSession>> {
        Ok(Vec::new())
    }
}

/// Stream `[start, end)` of `target`, natively when the backend can and in
/// [`STREAM_CHUNK_SIZE`] range reads otherwise.
pub async fn stream_range(
    store: Arc<dyn ChunkStore>,
    target: ReadTarget,
    start: u64,
    end: u64,
) -> StoreResult<ByteStream> {
    if let Some(stream) = store.open_stream(&target, start, end).await? {
        return Ok(stream);
    }

    let pieces = futures::stream::try_unfold(start, move |pos| {
        let store = store.clone();
        let target = target.clone();
        async move { read_piece(store.as_ref(), &target, pos, end).await }
    });
    Ok(Box::pin(pieces))
}

/// Check a `[start, end)` request against MAX_RANGE_SIZE.
pub(crate) fn check_range(start: u64, end: u64) -> StoreResult<()> {
    if end < start {
        return Err(StoreError::InvalidRange(format!(
            "end ({end}) < start ({start})"
        )));
    }
    if end - start > MAX_RANGE_SIZE {
        return Err(StoreError::InvalidRange(format!(
            "range size {} exceeds maximum {} bytes",
            end - start,
            MAX_RANGE_SIZE
        )));
    }
    Ok(())
}

/// Build the backend selected in configuration. Called once at startup.
pub async fn from_config(config: &StorageConfig) -> StoreResult<Arc<dyn ChunkStore>> {
    let store: Arc<dyn ChunkStore> = match config {
        StorageConfig::Local { root } => Arc::new(FilesystemStore::new(root).await?),
        StorageConfig::Memory => Arc::new(MemoryStore::new()),
        StorageConfig::S3 {
            bucket,
            prefix,
            region,
            endpoint,
            force_path_style,
        } => Arc::new(
            S3Store::new(
                bucket,
                prefix.clone(),
                region.clone(),
                endpoint.clone(),
                *force_path_style,
            )
            .await?,
        ),
        StorageConfig::Remote { endpoint, api_key } => {
            Arc::new(RemoteStore::new(endpoint, api_key.clone())?)
        }
    };

    tracing::info!("Using {} chunk store", store.backend_name());
    Ok(store)
}

async fn read_piece(
    store: &dyn ChunkStore,
    target: &ReadTarget,
    pos: u64,
    end: u64,
) -> StoreResult<Option<(Bytes, u64)>> {
    if pos >= end {
        return Ok(None);
    }
    let to = end.min(pos + STREAM_CHUNK_SIZE);
    let data = match target {
        ReadTarget::Upload(id) => store.read_range(id, pos, to).await?,
        ReadTarget::Stored(blob) => store.read_stored(blob, pos, to).await?,
    };
    if data.is_empty() {
        // shorter than expected, stop instead of spinning
        return Ok(None);
    }
    let next = pos + data.len() as u64;
    Ok(Some((data, next)))
}
