//! Local disk chunk store.
//!
//! In-progress uploads live as one growable file under `<root>/cache`,
//! with the session record beside it as `<id>.info` (JSON). Promotion
//! renames the file into `<root>/store`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::instrument;

use super::{check_range, ByteStream, ChunkStore, ReadTarget, StoreError, StoreResult, StoredBlob};
use crate::models::{UploadId, UploadSession};

const INFO_EXT: &str = "info";

pub struct FilesystemStore {
    cache_dir: PathBuf,
    store_dir: PathBuf,
}

impl FilesystemStore {
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        let cache_dir = root.join("cache");
        let store_dir = root.join("store");
        fs::create_dir_all(&cache_dir).await?;
        fs::create_dir_all(&store_dir).await?;
        Ok(Self {
            cache_dir,
            store_dir,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    fn cache_path(&self, id: &UploadId) -> PathBuf {
        // ids render as 32 hex chars, always a safe file name
        self.cache_dir.join(id.to_string())
    }

    fn info_path(&self, id: &UploadId) -> PathBuf {
        self.cache_dir.join(format!("{id}.{INFO_EXT}"))
    }

    fn stored_path(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty()
            || key.starts_with('.')
            || key.contains('/')
            || key.contains('\\')
            || key.contains("..")
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.store_dir.join(key))
    }

    async fn read_file_range(path: &Path, start: u64, end: u64, name: &str) -> StoreResult<Bytes> {
        check_range(start, end)?;
        let mut file = fs::File::open(path).await.map_err(|e| not_found(e, name))?;
        let len = file.metadata().await?.len();
        let end = end.min(len);
        if start >= end {
            return Ok(Bytes::new());
        }

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity((end - start) as usize);
        file.take(end - start).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn stream_file(path: &Path, start: u64, end: u64, name: &str) -> StoreResult<ByteStream> {
        let mut file = fs::File::open(path).await.map_err(|e| not_found(e, name))?;
        let end = end.min(file.metadata().await?.len());
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let stream = ReaderStream::new(file.take(end.saturating_sub(start))).map_err(StoreError::Io);
        Ok(Box::pin(stream))
    }

    async fn remove_if_present(path: &Path) -> StoreResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

fn not_found(e: std::io::Error, name: &str) -> StoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(name.to_string())
    } else {
        StoreError::Io(e)
    }
}

#[async_trait]
impl ChunkStore for FilesystemStore {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn create(&self, id: &UploadId, _length: Option<u64>) -> StoreResult<()> {
        let path = self.cache_path(id);
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StoreError::AlreadyExists(id.to_string())
                } else {
                    StoreError::Io(e)
                }
            })?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn append(&self, id: &UploadId, expected_offset: u64, data: Bytes) -> StoreResult<u64> {
        let path = self.cache_path(id);
        // never create here: a terminated upload must stay gone
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| not_found(e, &id.to_string()))?;

        let position = file.metadata().await?.len();
        if position != expected_offset {
            return Err(StoreError::OffsetMismatch {
                expected: expected_offset,
                actual: position,
            });
        }

        file.seek(std::io::SeekFrom::Start(position)).await?;
        let written = async {
            file.write_all(&data).await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            // roll back a torn write so the position stays authoritative
            tracing::warn!("Append to {} failed, truncating to {}: {}", id, position, e);
            if let Err(trunc) = file.set_len(position).await {
                tracing::error!("Failed to truncate {} after torn write: {}", id, trunc);
            }
            return Err(StoreError::Io(e));
        }

        Ok(position + data.len() as u64)
    }

    async fn position(&self, id: &UploadId) -> StoreResult<u64> {
        let meta = fs::metadata(self.cache_path(id))
            .await
            .map_err(|e| not_found(e, &id.to_string()))?;
        Ok(meta.len())
    }

    async fn read_range(&self, id: &UploadId, start: u64, end: u64) -> StoreResult<Bytes> {
        Self::read_file_range(&self.cache_path(id), start, end, &id.to_string()).await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn promote(&self, id: &UploadId, key: &str) -> StoreResult<StoredBlob> {
        let from = self.cache_path(id);
        let to = self.stored_path(key)?;
        let size = fs::metadata(&from)
            .await
            .map_err(|e| not_found(e, &id.to_string()))?
            .len();

        fs::rename(&from, &to).await?;
        tracing::debug!("Moved {:?} -> {:?}", from, to);

        Ok(StoredBlob {
            key: key.to_string(),
            size,
        })
    }

    async fn read_stored(&self, blob: &StoredBlob, start: u64, end: u64) -> StoreResult<Bytes> {
        let path = self.stored_path(&blob.key)?;
        Self::read_file_range(&path, start, end, &blob.key).await
    }

    async fn open_stream(
        &self,
        target: &ReadTarget,
        start: u64,
        end: u64,
    ) -> StoreResult<Option<ByteStream>> {
        let stream = match target {
            ReadTarget::Upload(id) => {
                Self::stream_file(&self.cache_path(id), start, end, &id.to_string()).await?
            }
            ReadTarget::Stored(blob) => {
                Self::stream_file(&self.stored_path(&blob.key)?, start, end, &blob.key).await?
            }
        };
        Ok(Some(stream))
    }

    async fn delete(&self, id: &UploadId) -> StoreResult<()> {
        Self::remove_if_present(&self.cache_path(id)).await?;
        Self::remove_if_present(&self.info_path(id)).await
    }

    async fn delete_stored(&self, blob: &StoredBlob) -> StoreResult<()> {
        Self::remove_if_present(&self.stored_path(&blob.key)?).await
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn save_session(&self, session: &UploadSession) -> StoreResult<()> {
        let json = serde_json::to_vec(session)
            .map_err(|e| StoreError::Backend(format!("failed to encode session: {e}")))?;
        // write then rename so a crash never leaves a torn record
        let path = self.info_path(&session.id);
        let tmp = path.with_extension(format!("{INFO_EXT}.tmp"));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_sessions(&self) -> StoreResult<Vec<UploadSession>> {
        let mut sessions = Vec::new();
        let mut data_files = Vec::new();
        let mut entries = fs::read_dir(&self.cache_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if let Some(stem) = name.strip_suffix(&format!(".{INFO_EXT}")) {
                let raw = fs::read(&path).await?;
                match serde_json::from_slice::<UploadSession>(&raw) {
                    Ok(session) if session.id.to_string() == stem => sessions.push(session),
                    _ => {
                        tracing::warn!("Skipping unreadable session record {:?}", path);
                    }
                }
            } else if name.ends_with(".tmp") {
                Self::remove_if_present(&path).await?;
            } else if let Some(id) = UploadId::parse(name) {
                data_files.push((id, path));
            }
        }

        // bytes nobody can resume are reclaimed here, the sweeper never sees them
        let known: HashSet<UploadId> = sessions.iter().map(|s| s.id).collect();
        for (id, path) in data_files {
            if !known.contains(&id) {
                tracing::info!("🧹 Removing orphaned upload data {}", id);
                Self::remove_if_present(&path).await?;
            }
        }

        Ok(sessions)
    }
}
