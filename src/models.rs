use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::metadata::UploadMetadata;
use crate::store::StoredBlob;

/// opaque, url-safe identifier of one resumable upload
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// parse an id taken from a request path; `None` for anything we never issued
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::try_parse(s).ok().map(Self)
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0.simple())
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// lifecycle of an upload session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// created, no bytes received yet
    Created,
    /// at least one patch applied
    Receiving,
    /// all bytes received and handed off to permanent storage
    Finalized,
}

impl SessionState {
    pub fn accepts_patch(&self) -> bool {
        matches!(self, Self::Created | Self::Receiving)
    }
}

/// the last successful append, kept so a retried patch can be acknowledged
/// without writing the bytes twice
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRecord {
    pub offset: u64,
    pub length: u64,
    /// hex sha256 of the appended bytes
    pub digest: String,
}

/// server-side record of one upload's progress
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: UploadId,
    /// declared final length; `None` while the length is deferred
    pub total_length: Option<u64>,
    pub offset: u64,
    pub metadata: UploadMetadata,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_append: Option<AppendRecord>,
    /// permanent location once finalized
    pub stored: Option<StoredBlob>,
}

impl UploadSession {
    pub fn new(
        total_length: Option<u64>,
        metadata: UploadMetadata,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: UploadId::new(),
            total_length,
            offset: 0,
            metadata,
            state: SessionState::Created,
            created_at: now,
            expires_at: now + ttl,
            last_append: None,
            stored: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_finalized(&self) -> bool {
        self.state == SessionState::Finalized
    }

    /// every declared byte has been received
    pub fn is_complete(&self) -> bool {
        self.total_length == Some(self.offset)
    }
}

/// storage stage of an attachment descriptor
pub const CACHE_STORAGE: &str = "cache";

/// file facts carried inside an attachment descriptor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    pub filename: Option<String>,
    pub size: u64,
    pub mime_type: Option<String>,
}

/// `{id, storage, metadata}` handed to the attachment library once an
/// upload finishes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub id: String,
    pub storage: String,
    pub metadata: AttachmentMetadata,
}

impl AttachmentDescriptor {
    /// descriptor for a blob still living in the upload server's cache stage
    pub fn cached(
        id: impl Into<String>,
        filename: Option<String>,
        size: u64,
        mime_type: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            storage: CACHE_STORAGE.to_string(),
            metadata: AttachmentMetadata {
                filename,
                size,
                mime_type,
            },
        }
    }
}

// generic error response
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub code: String,
    pub error: String,
}

// response for server statistics endpoint
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct StatsResponse {
    pub active_uploads: usize,
    pub finalized_uploads: usize,
    pub bytes_received: u64,
    pub backend: String,
}
