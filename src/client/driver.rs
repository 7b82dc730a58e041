//! Chunked, resumable upload of one file.
//!
//! The driver walks the protocol (create, patch until done) and recovers on
//! its own: transient failures are retried with backoff after re-reading the
//! server offset, an expired session is started over. Only definitive
//! rejections and exhausted retries reach the caller, and those keep the
//! upload url so the caller can resume later.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::{TransportError, UploadStatus, UploadTransport};
use crate::metadata::UploadMetadata;
use crate::models::AttachmentDescriptor;

pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// times an expired session is recreated before giving up
const DEFAULT_MAX_RESTARTS: usize = 2;

/// Backoff schedule. The n-th consecutive failure waits `delays[n]`; once
/// the schedule runs out the driver gives up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new([0, 1, 3, 6, 10].into_iter().map(Duration::from_secs).collect())
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// fail on the first error
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// `attempts` retries without waiting
    pub fn immediate(attempts: usize) -> Self {
        Self::new(vec![Duration::ZERO; attempts])
    }

    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    pub fn max_retries(&self) -> usize {
        self.delays.len()
    }
}

/// random access to the bytes being uploaded
#[async_trait]
pub trait ByteSource: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// up to `len` bytes starting at `offset`
    async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Bytes>;
}

#[async_trait]
impl ByteSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let start = (offset as usize).min(Bytes::len(self));
        let end = start.saturating_add(len).min(Bytes::len(self));
        Ok(self.slice(start..end))
    }
}

/// a file on disk, read chunk by chunk
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let len = len.min(self.len.saturating_sub(offset) as usize);
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// a source plus the facts that go into upload metadata
#[derive(Clone)]
pub struct UploadFile {
    pub source: Arc<dyn ByteSource>,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
}

impl UploadFile {
    pub fn from_bytes(data: impl Into<Bytes>, filename: impl Into<String>) -> Self {
        Self {
            source: Arc::new(data.into()),
            filename: Some(filename.into()),
            mime_type: None,
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let source = FileSource::open(path).await?;
        Ok(Self {
            source: Arc::new(source),
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            mime_type: None,
        })
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn size(&self) -> u64 {
        self.source.len()
    }

    fn metadata(&self) -> UploadMetadata {
        let mut metadata = UploadMetadata::new();
        if let Some(name) = &self.filename {
            metadata = metadata.with("filename", name.clone());
        }
        if let Some(mime) = &self.mime_type {
            metadata = metadata.with("filetype", mime.clone());
        }
        metadata
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// bytes the server has acknowledged
    pub bytes_sent: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub upload_url: String,
    pub descriptor: AttachmentDescriptor,
    pub size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("upload cancelled")]
    Cancelled { upload_url: Option<String> },

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        upload_url: Option<String>,
        attempts: usize,
        #[source]
        source: TransportError,
    },

    #[error("upload rejected: {source}")]
    Rejected {
        upload_url: Option<String>,
        #[source]
        source: TransportError,
    },

    #[error("failed to read upload source: {0}")]
    Source(#[from] std::io::Error),
}

impl DriverError {
    /// url of a still-resumable upload, if one was created and has not expired
    pub fn upload_url(&self) -> Option<&str> {
        match self {
            Self::Cancelled { upload_url }
            | Self::RetriesExhausted { upload_url, .. }
            | Self::Rejected { upload_url, .. } => upload_url.as_deref(),
            Self::Source(_) => None,
        }
    }
}

enum Advance {
    Created(String),
    Synced(UploadStatus),
    Sent(u64),
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

pub struct UploadDriver<T> {
    transport: T,
    chunk_size: usize,
    retry: RetryPolicy,
    max_restarts: usize,
    progress: watch::Sender<Progress>,
}

impl<T: UploadTransport> UploadDriver<T> {
    pub fn new(transport: T) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            transport,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            progress,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    fn report(&self, bytes_sent: u64, total: u64) {
        self.progress.send_replace(Progress { bytes_sent, total });
    }

    /// Upload `file`, resuming `resume_url` when given.
    pub async fn upload(
        &self,
        file: &UploadFile,
        resume_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, DriverError> {
        let total = file.size();
        let metadata = file.metadata();

        let mut url = resume_url.map(str::to_string);
        let mut offset = 0u64;
        let mut needs_sync = url.is_some();
        let mut attempt = 0usize;
        let mut restarts = 0usize;
        self.report(0, total);

        loop {
            if cancel.is_cancelled() {
                return Err(DriverError::Cancelled { upload_url: url });
            }

            if let Some(done) = url.as_ref().filter(|_| !needs_sync && offset == total) {
                tracing::info!("✅ Uploaded {} bytes to {}", total, done);
                return Ok(UploadOutcome {
                    upload_url: done.clone(),
                    descriptor: AttachmentDescriptor::cached(
                        done.clone(),
                        file.filename.clone(),
                        total,
                        file.mime_type.clone(),
                    ),
                    size: total,
                });
            }

            let chunk = match (&url, needs_sync) {
                (Some(_), false) => {
                    let len = self.chunk_size.min((total - offset) as usize);
                    Some(file.source.read_at(offset, len).await?)
                }
                _ => None,
            };

            let call = async {
                match (url.as_deref(), chunk) {
                    (None, _) => self
                        .transport
                        .create(Some(total), &metadata)
                        .await
                        .map(Advance::Created),
                    (Some(u), None) => self.transport.head(u).await.map(Advance::Synced),
                    (Some(u), Some(data)) => self
                        .transport
                        .patch(u, offset, data)
                        .await
                        .map(Advance::Sent),
                }
            };
            let Some(result) = until_cancelled(cancel, call).await else {
                return Err(DriverError::Cancelled { upload_url: url });
            };

            let err = match result {
                Ok(Advance::Created(created)) => {
                    tracing::debug!("Created upload {} ({} bytes)", created, total);
                    url = Some(created);
                    offset = 0;
                    attempt = 0;
                    continue;
                }
                Ok(Advance::Synced(status)) => {
                    if status.offset > total || status.length.is_some_and(|l| l != total) {
                        return Err(DriverError::Rejected {
                            upload_url: url,
                            source: TransportError::InvalidResponse(format!(
                                "server holds {}/{:?} bytes, local file has {}",
                                status.offset, status.length, total
                            )),
                        });
                    }
                    // a resync alone is not progress; only new bytes reset the retry budget
                    if status.offset > offset {
                        attempt = 0;
                    }
                    offset = status.offset;
                    needs_sync = false;
                    self.report(offset, total);
                    continue;
                }
                Ok(Advance::Sent(new_offset)) if new_offset > offset && new_offset <= total => {
                    offset = new_offset;
                    attempt = 0;
                    self.report(offset, total);
                    continue;
                }
                Ok(Advance::Sent(new_offset)) => TransportError::InvalidResponse(format!(
                    "patch at {offset} answered with offset {new_offset}"
                )),
                Err(e) => e,
            };

            match &err {
                TransportError::NotFound => {
                    if restarts >= self.max_restarts {
                        return Err(DriverError::RetriesExhausted {
                            upload_url: None,
                            attempts: restarts + 1,
                            source: err,
                        });
                    }
                    tracing::warn!(
                        "Upload {} is gone on the server, starting over",
                        url.as_deref().unwrap_or("<new>")
                    );
                    restarts += 1;
                    url = None;
                    offset = 0;
                    needs_sync = false;
                    attempt = 0;
                    self.report(0, total);
                    continue;
                }
                TransportError::OffsetMismatch { current } => match current {
                    Some(current) if *current <= total => offset = *current,
                    _ => needs_sync = true,
                },
                // the server may have applied the chunk before failing
                e if e.is_retryable() => needs_sync = url.is_some(),
                _ => {
                    return Err(DriverError::Rejected {
                        upload_url: url,
                        source: err,
                    });
                }
            }

            let Some(delay) = self.retry.delay(attempt) else {
                return Err(DriverError::RetriesExhausted {
                    upload_url: url,
                    attempts: attempt + 1,
                    source: err,
                });
            };
            attempt += 1;
            tracing::warn!(
                "Upload step failed ({}), retry {}/{} in {:?}",
                err,
                attempt,
                self.retry.max_retries(),
                delay
            );

            if until_cancelled(cancel, tokio::time::sleep(delay))
                .await
                .is_none()
            {
                return Err(DriverError::Cancelled { upload_url: url });
            }
        }
    }
}
