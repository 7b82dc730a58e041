//! Protocol error taxonomy and its HTTP mapping.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::headers;
use crate::models::ErrorResponse;
use crate::store::StoreError;

/// tus checksum extension status for a body that fails verification
pub const CHECKSUM_MISMATCH_STATUS: u16 = 460;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid upload metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("offset mismatch: request offset {expected}, upload is at {current}")]
    OffsetMismatch { expected: u64, current: u64 },

    #[error("upload not found")]
    NotFound,

    #[error("another patch for this upload is in progress")]
    Conflict,

    #[error("upload is already finalized at offset {offset}")]
    Finalized { offset: u64 },

    #[error("write to offset {attempted} exceeds upload length {length}")]
    LengthExceeded { length: u64, attempted: u64 },

    #[error("upload length {length} exceeds the maximum of {max} bytes")]
    TooLarge { length: u64, max: u64 },

    #[error("requested range is not satisfiable")]
    RangeNotSatisfiable,

    #[error("content type must be application/offset+octet-stream")]
    UnsupportedMediaType,

    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedChecksum(String),

    #[error("checksum of the request body does not match")]
    ChecksumMismatch,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("storage failure: {0}")]
    StorageFailure(StoreError),
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::NotFound,
            StoreError::OffsetMismatch { expected, actual } => Self::OffsetMismatch {
                expected,
                current: actual,
            },
            StoreError::InvalidRange(_) => Self::RangeNotSatisfiable,
            other => Self::StorageFailure(other),
        }
    }
}

impl UploadError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMetadata(_) => "invalid_metadata",
            Self::InvalidRequest(_) => "invalid_request",
            Self::OffsetMismatch { .. } => "offset_mismatch",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Finalized { .. } => "finalized",
            Self::LengthExceeded { .. } => "length_exceeded",
            Self::TooLarge { .. } => "too_large",
            Self::RangeNotSatisfiable => "range_not_satisfiable",
            Self::UnsupportedMediaType => "unsupported_media_type",
            Self::UnsupportedChecksum(_) => "unsupported_checksum",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::StorageFailure(_) => "storage_failure",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidMetadata(_) | Self::InvalidRequest(_) | Self::UnsupportedChecksum(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::OffsetMismatch { .. } => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::LOCKED,
            Self::Finalized { .. } => StatusCode::FORBIDDEN,
            Self::LengthExceeded { .. } | Self::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::ChecksumMismatch => StatusCode::from_u16(CHECKSUM_MISMATCH_STATUS)
                .unwrap_or(StatusCode::BAD_REQUEST),
            Self::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
            Self::StorageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// errors a client may retry without changing the request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageFailure(_) | Self::Conflict | Self::ChecksumMismatch
        )
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Upload request failed: {}", self);
        } else {
            tracing::debug!("Upload request rejected ({}): {}", status, self);
        }

        let body = ErrorResponse {
            code: self.code().to_string(),
            error: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        let map = response.headers_mut();

        match &self {
            Self::OffsetMismatch { current: offset, .. } | Self::Finalized { offset } => {
                if let Ok(value) = HeaderValue::from_str(&offset.to_string()) {
                    map.insert(headers::UPLOAD_OFFSET, value);
                }
            }
            Self::UnsupportedVersion(_) => {
                map.insert(
                    headers::TUS_VERSION,
                    HeaderValue::from_static(headers::PROTOCOL_VERSION),
                );
            }
            _ => {}
        }

        response
    }
}
