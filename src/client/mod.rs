//! Client side of the upload protocol.
//!
//! [`UploadTransport`] is the seam between the retrying [`UploadDriver`] and
//! whatever speaks to the server: [`TusClient`] over HTTP, or
//! [`LocalTransport`] straight into an in-process engine.

pub mod driver;
pub mod http;
pub mod local;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::UploadError;
use crate::metadata::UploadMetadata;

pub use driver::{
    ByteSource, DriverError, FileSource, Progress, RetryPolicy, UploadDriver, UploadFile,
    UploadOutcome, DEFAULT_CHUNK_SIZE,
};
pub use http::TusClient;
pub use local::LocalTransport;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// no response at all (dns, refused, reset, timeout)
    #[error("connection error: {0}")]
    Connection(String),

    #[error("upload not found or expired")]
    NotFound,

    #[error("offset mismatch, server is at {current:?}")]
    OffsetMismatch { current: Option<u64> },

    #[error("upload is locked by another request")]
    Locked,

    #[error("server rejected the chunk checksum")]
    ChecksumMismatch,

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request rejected with {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TransportError {
    /// worth retrying the same request after a delay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Locked | Self::ChecksumMismatch | Self::Server { .. }
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Connection(err.to_string())
    }
}

impl From<UploadError> for TransportError {
    fn from(err: UploadError) -> Self {
        let status = err.status_code().as_u16();
        match err {
            UploadError::NotFound => TransportError::NotFound,
            UploadError::OffsetMismatch { current, .. } => TransportError::OffsetMismatch {
                current: Some(current),
            },
            UploadError::Conflict => TransportError::Locked,
            UploadError::ChecksumMismatch => TransportError::ChecksumMismatch,
            UploadError::StorageFailure(e) => TransportError::Server {
                status,
                message: e.to_string(),
            },
            other => TransportError::Rejected {
                status,
                message: other.to_string(),
            },
        }
    }
}

/// what HEAD reports about an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadStatus {
    pub offset: u64,
    /// `None` while the length is deferred
    pub length: Option<u64>,
}

/// what OPTIONS reports about a server
#[derive(Debug, Clone, Default)]
pub struct ServerCapabilities {
    pub versions: Vec<String>,
    pub extensions: Vec<String>,
    pub max_size: Option<u64>,
}

impl ServerCapabilities {
    pub fn supports_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    pub fn supports_extension(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }
}

/// The four protocol requests the driver needs. Uploads are addressed by
/// the url returned from `create`.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn create(
        &self,
        length: Option<u64>,
        metadata: &UploadMetadata,
    ) -> Result<String, TransportError>;

    async fn head(&self, url: &str) -> Result<UploadStatus, TransportError>;

    /// Send `data` at `offset`; returns the server's new offset.
    async fn patch(&self, url: &str, offset: u64, data: Bytes) -> Result<u64, TransportError>;

    async fn terminate(&self, url: &str) -> Result<(), TransportError>;
}
