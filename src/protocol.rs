//! Resumable upload state machine.
//!
//! `created -> receiving -> finalized`, or removed by terminate/expiry. The
//! engine owns the session registry and delegates bytes to a [`ChunkStore`];
//! the store's write position and the session offset move together under the
//! per-session patch lock.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::UploadError;
use crate::metadata::{UploadMetadata, DEFAULT_MAX_METADATA_SIZE};
use crate::models::{AppendRecord, SessionState, UploadId, UploadSession};
use crate::registry::{RegistryStats, SessionRegistry};
use crate::store::{stream_range, ByteStream, ChunkStore, ReadTarget, StoreError};
use crate::utils::{file_extension, parse_range};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// engine settings, passed in at construction
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// largest accepted upload length
    pub max_size: Option<u64>,
    /// how long a session stays alive after creation or its last patch
    pub upload_ttl: chrono::Duration,
    pub max_metadata_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            upload_ttl: chrono::Duration::days(7),
            max_metadata_size: DEFAULT_MAX_METADATA_SIZE,
        }
    }
}

/// lifecycle notifications for external collaborators
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Created {
        id: UploadId,
        total_length: Option<u64>,
    },
    /// bytes were handed off to permanent storage
    Finalized { session: UploadSession },
    Terminated { id: UploadId },
    Expired { id: UploadId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
}

/// an `Upload-Checksum` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: Vec<u8>,
}

impl Checksum {
    pub fn sha256(data: &[u8]) -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Sha256,
            digest: Sha256::digest(data).to_vec(),
        }
    }

    /// parse `<algorithm> <base64 digest>`
    pub fn parse(header: &str) -> Result<Self, UploadError> {
        let (algorithm, encoded) = header
            .trim()
            .split_once(' ')
            .ok_or_else(|| UploadError::InvalidRequest("malformed Upload-Checksum".to_string()))?;

        let algorithm = match algorithm.to_ascii_lowercase().as_str() {
            "sha256" => ChecksumAlgorithm::Sha256,
            other => return Err(UploadError::UnsupportedChecksum(other.to_string())),
        };
        let digest = STANDARD.decode(encoded.trim()).map_err(|e| {
            UploadError::InvalidRequest(format!("Upload-Checksum digest is not base64: {e}"))
        })?;

        Ok(Self { algorithm, digest })
    }

    pub fn to_header(&self) -> String {
        let name = match self.algorithm {
            ChecksumAlgorithm::Sha256 => "sha256",
        };
        format!("{} {}", name, STANDARD.encode(&self.digest))
    }
}

/// one PATCH worth of input
#[derive(Debug, Clone, Default)]
pub struct PatchRequest {
    pub expected_offset: u64,
    pub data: Bytes,
    pub checksum: Option<Checksum>,
    /// sets a length that was deferred at creation
    pub declared_length: Option<u64>,
}

impl PatchRequest {
    pub fn new(expected_offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            expected_offset,
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.declared_length = Some(length);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub offset: u64,
    pub expires_at: DateTime<Utc>,
    pub finalized: bool,
    /// acknowledged from the last append record without writing
    pub replayed: bool,
}

impl PatchOutcome {
    fn of(session: &UploadSession, replayed: bool) -> Self {
        Self {
            offset: session.offset,
            expires_at: session.expires_at,
            finalized: session.is_finalized(),
            replayed,
        }
    }
}

/// bytes served for a GET, streamed from the store
pub struct Download {
    pub body: ByteStream,
    pub start: u64,
    pub end: u64,
    /// bytes currently available in full
    pub total: u64,
    pub partial: bool,
    pub session: UploadSession,
}

impl Download {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Buffer the whole body.
    pub async fn into_bytes(mut self) -> Result<Bytes, UploadError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

pub struct UploadEngine {
    store: Arc<dyn ChunkStore>,
    registry: SessionRegistry,
    config: EngineConfig,
    events: broadcast::Sender<UploadEvent>,
}

impl UploadEngine {
    pub fn new(store: Arc<dyn ChunkStore>, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            registry: SessionRegistry::new(),
            config,
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: UploadEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// write the session record through to the store
    async fn persist(&self, session: &UploadSession) {
        if let Err(e) = self.store.save_session(session).await {
            tracing::warn!("Failed to persist session {}: {}", session.id, e);
        }
    }

    /// decode an `Upload-Metadata` header under the configured size cap
    pub fn parse_metadata(&self, header: &str) -> Result<UploadMetadata, UploadError> {
        UploadMetadata::parse(header, self.config.max_metadata_size)
    }

    fn check_max_size(&self, length: u64) -> Result<(), UploadError> {
        match self.config.max_size {
            Some(max) if length > max => Err(UploadError::TooLarge { length, max }),
            _ => Ok(()),
        }
    }

    /// Allocate a new session at offset 0. `length: None` defers the length.
    pub async fn create(
        &self,
        length: Option<u64>,
        metadata: UploadMetadata,
    ) -> Result<UploadSession, UploadError> {
        if let Some(length) = length {
            self.check_max_size(length)?;
        }

        let session = UploadSession::new(length, metadata, self.config.upload_ttl);
        self.store.create(&session.id, length).await?;
        if !self.registry.insert_if_absent(session.clone()) {
            self.store.delete(&session.id).await?;
            return Err(UploadError::InvalidRequest(
                "upload id collision, retry".to_string(),
            ));
        }
        self.persist(&session).await;

        tracing::info!(
            "📤 Created upload {} (length: {})",
            session.id,
            length.map_or_else(|| "deferred".to_string(), |l| l.to_string())
        );
        self.emit(UploadEvent::Created {
            id: session.id,
            total_length: length,
        });

        if session.is_complete() {
            // zero-length upload, nothing to wait for
            return self.finalize(session).await;
        }
        Ok(session)
    }

    /// Append a chunk at `expected_offset`.
    pub async fn patch(
        &self,
        id: &UploadId,
        req: PatchRequest,
    ) -> Result<PatchOutcome, UploadError> {
        let _guard = self.registry.begin_patch(id)?;
        let now = Utc::now();
        let session = self.registry.get(id, now).ok_or(UploadError::NotFound)?;

        let digest = Sha256::digest(&req.data);
        if let Some(checksum) = &req.checksum {
            if checksum.digest.as_slice() != digest.as_slice() {
                tracing::warn!("Checksum mismatch on upload {} at {}", id, req.expected_offset);
                return Err(UploadError::ChecksumMismatch);
            }
        }
        let digest = hex::encode(digest);
        let chunk_len = req.data.len() as u64;

        if let Some(last) = &session.last_append {
            if chunk_len > 0
                && last.offset == req.expected_offset
                && last.length == chunk_len
                && last.digest == digest
                && last.offset + last.length == session.offset
            {
                tracing::debug!(
                    "Replayed patch for {} at {}, acknowledging offset {}",
                    id,
                    req.expected_offset,
                    session.offset
                );
                if session.is_complete() && !session.is_finalized() {
                    // an earlier promotion failed
                    let finalized = self.finalize(session).await?;
                    return Ok(PatchOutcome::of(&finalized, true));
                }
                return Ok(PatchOutcome::of(&session, true));
            }
        }

        if !session.state.accepts_patch() {
            if chunk_len == 0 && req.expected_offset == session.offset {
                return Ok(PatchOutcome::of(&session, false));
            }
            return Err(UploadError::Finalized {
                offset: session.offset,
            });
        }

        if req.expected_offset != session.offset {
            tracing::debug!(
                "Offset mismatch on {}: request {}, upload at {}",
                id,
                req.expected_offset,
                session.offset
            );
            return Err(UploadError::OffsetMismatch {
                expected: req.expected_offset,
                current: session.offset,
            });
        }

        let declared = match req.declared_length {
            Some(length) => self.check_declared_length(&session, length)?,
            None => None,
        };
        let new_offset = session.offset + chunk_len;
        match declared.or(session.total_length) {
            Some(total) if new_offset > total => {
                return Err(UploadError::LengthExceeded {
                    length: total,
                    attempted: new_offset,
                });
            }
            None => self.check_max_size(new_offset)?,
            _ => {}
        }
        let session = match declared {
            Some(length) => self.apply_length(&session, length, now).await?,
            None => session,
        };

        if chunk_len > 0 {
            match self.store.append(id, session.offset, req.data).await {
                Ok(position) if position == new_offset => {}
                Ok(position) => {
                    return Err(UploadError::StorageFailure(StoreError::Backend(format!(
                        "store reported position {position}, expected {new_offset}"
                    ))));
                }
                Err(StoreError::NotFound(_)) => return Err(UploadError::NotFound),
                Err(e) => return Err(e.into()),
            }
        }

        let expires_at = now + self.config.upload_ttl;
        let record = (chunk_len > 0).then(|| AppendRecord {
            offset: session.offset,
            length: chunk_len,
            digest,
        });
        let updated = match self
            .registry
            .compare_and_swap(id, session.offset, now, |s| {
                s.offset = new_offset;
                s.expires_at = expires_at;
                if let Some(record) = record {
                    s.state = SessionState::Receiving;
                    s.last_append = Some(record);
                }
            }) {
            Ok(updated) => updated,
            Err(UploadError::NotFound) => {
                // terminated while the bytes were in flight
                tracing::warn!("Upload {} vanished mid-patch, reclaiming bytes", id);
                if let Err(e) = self.store.delete(id).await {
                    tracing::warn!("Failed to reclaim bytes of {}: {}", id, e);
                }
                return Err(UploadError::NotFound);
            }
            Err(e) => return Err(e),
        };

        tracing::debug!("📦 Upload {} at {}/{:?}", id, updated.offset, updated.total_length);
        self.persist(&updated).await;

        if updated.is_complete() {
            let finalized = self.finalize(updated).await?;
            return Ok(PatchOutcome::of(&finalized, false));
        }
        Ok(PatchOutcome::of(&updated, false))
    }

    /// validate an `Upload-Length` sent on PATCH; `Some` when it still has to be recorded
    fn check_declared_length(
        &self,
        session: &UploadSession,
        length: u64,
    ) -> Result<Option<u64>, UploadError> {
        match session.total_length {
            Some(existing) if existing == length => return Ok(None),
            Some(existing) => {
                return Err(UploadError::InvalidRequest(format!(
                    "upload length is already {existing}"
                )));
            }
            None => {}
        }
        if length < session.offset {
            return Err(UploadError::InvalidRequest(format!(
                "upload length {length} is below the current offset {}",
                session.offset
            )));
        }
        self.check_max_size(length)?;
        Ok(Some(length))
    }

    async fn apply_length(
        &self,
        session: &UploadSession,
        length: u64,
        now: DateTime<Utc>,
    ) -> Result<UploadSession, UploadError> {
        self.store.declare_length(&session.id, length).await?;
        let updated = self
            .registry
            .update(&session.id, now, |s| s.total_length = Some(length))?;
        self.persist(&updated).await;
        Ok(updated)
    }

    /// hand the finished bytes to permanent storage
    async fn finalize(&self, session: UploadSession) -> Result<UploadSession, UploadError> {
        let ext = session
            .metadata
            .filename()
            .and_then(file_extension)
            .unwrap_or_default();
        let key = format!("{}{}", UploadId::new(), ext);
        let blob = self.store.promote(&session.id, &key).await?;

        let stored = blob.clone();
        match self.registry.update(&session.id, Utc::now(), |s| {
            s.state = SessionState::Finalized;
            s.stored = Some(stored);
        }) {
            Ok(finalized) => {
                self.persist(&finalized).await;
                tracing::info!(
                    "✅ Upload {} finalized ({} bytes) as {}",
                    finalized.id,
                    finalized.offset,
                    blob.key
                );
                self.emit(UploadEvent::Finalized {
                    session: finalized.clone(),
                });
                Ok(finalized)
            }
            Err(e) => {
                tracing::warn!("Upload {} terminated during promotion", session.id);
                if let Err(err) = self.store.delete_stored(&blob).await {
                    tracing::warn!("Failed to reclaim promoted blob {}: {}", blob.key, err);
                }
                Err(e)
            }
        }
    }

    /// Reload the sessions a previous process persisted. Records whose bytes
    /// are gone are dropped, offsets follow what the store actually holds,
    /// and uploads that were complete but never promoted are finalized now.
    /// Returns how many sessions are live again.
    pub async fn restore(&self) -> Result<usize, UploadError> {
        let now = Utc::now();
        let mut restored = 0;

        for mut session in self.store.load_sessions().await? {
            let id = session.id;
            if session.is_expired(now) {
                if let Err(e) = self.store.delete(&id).await {
                    tracing::warn!("Failed to reclaim expired upload {}: {}", id, e);
                }
                continue;
            }

            if !session.is_finalized() {
                let position = match self.store.position(&id).await {
                    Ok(position) => position,
                    Err(StoreError::NotFound(_)) => {
                        tracing::warn!("Dropping record of upload {}, its bytes are gone", id);
                        self.store.delete(&id).await?;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                if session.total_length.is_some_and(|total| position > total) {
                    tracing::warn!("Dropping upload {}, data overruns its length", id);
                    self.store.delete(&id).await?;
                    continue;
                }
                if position != session.offset {
                    tracing::warn!(
                        "Upload {} record says offset {}, store holds {}",
                        id,
                        session.offset,
                        position
                    );
                    session.offset = position;
                    session.last_append = None;
                }
                if position > 0 {
                    session.state = SessionState::Receiving;
                }
            }

            if !self.registry.insert_if_absent(session.clone()) {
                continue;
            }
            restored += 1;

            if session.is_complete() && !session.is_finalized() {
                if let Err(e) = self.finalize(session).await {
                    tracing::warn!("Failed to finalize restored upload {}: {}", id, e);
                }
            }
        }

        if restored > 0 {
            tracing::info!("♻️  Restored {} uploads", restored);
        }
        Ok(restored)
    }

    /// Current state without mutating anything.
    pub fn head(&self, id: &UploadId) -> Result<UploadSession, UploadError> {
        self.registry
            .get(id, Utc::now())
            .ok_or(UploadError::NotFound)
    }

    /// Delete a session and its bytes. Unknown ids are not an error.
    pub async fn terminate(&self, id: &UploadId) -> Result<(), UploadError> {
        match self.registry.remove(id) {
            Some(_) => {
                // a finalized upload only loses its record, the promoted blob stays
                self.store.delete(id).await?;
                tracing::info!("🗑️  Terminated upload {}", id);
                self.emit(UploadEvent::Terminated { id: *id });
            }
            None => {
                self.store.delete(id).await?;
                tracing::debug!("Terminate for unknown upload {}", id);
            }
        }
        Ok(())
    }

    /// Read received bytes, honoring an optional `Range` header.
    pub async fn read(
        &self,
        id: &UploadId,
        range: Option<&str>,
    ) -> Result<Download, UploadError> {
        let session = self.head(id)?;
        let total = match &session.stored {
            Some(blob) => blob.size,
            None => session.offset,
        };

        let requested = match range {
            Some(header) => {
                parse_range(header, total).map_err(|_| UploadError::RangeNotSatisfiable)?
            }
            None => None,
        };
        let (start, end) = requested.unwrap_or((0, total));

        let target = match &session.stored {
            Some(blob) => ReadTarget::Stored(blob.clone()),
            None => ReadTarget::Upload(*id),
        };
        let body = stream_range(self.store.clone(), target, start, end).await?;

        Ok(Download {
            body,
            start,
            end,
            total,
            partial: requested.is_some(),
            session,
        })
    }

    /// Reclaim every session whose expiry has passed. Returns how many.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut swept = 0;
        for id in self.registry.expired(now) {
            if self.registry.remove(&id).is_none() {
                continue;
            }
            if let Err(e) = self.store.delete(&id).await {
                tracing::warn!("Failed to reclaim expired upload {}: {}", id, e);
            }
            self.emit(UploadEvent::Expired { id });
            swept += 1;
        }

        if swept > 0 {
            tracing::info!("🧹 Swept {} expired uploads", swept);
        }
        swept
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats(Utc::now())
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }
}
