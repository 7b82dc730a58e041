use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;

use crate::error::UploadError;
use crate::headers::{
    CHECKSUM_ALGORITHMS, OFFSET_OCTET_STREAM, PROTOCOL_VERSION, SUPPORTED_EXTENSIONS,
    TUS_CHECKSUM_ALGORITHM, TUS_EXTENSION, TUS_MAX_SIZE, TUS_VERSION, UPLOAD_CHECKSUM,
    UPLOAD_DEFER_LENGTH, UPLOAD_EXPIRES, UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
};
use crate::metadata::UploadMetadata;
use crate::models::{StatsResponse, UploadId, UploadSession};
use crate::protocol::{Checksum, PatchRequest};
use crate::state::AppState;
use crate::utils::{http_date, parse_u64_header, sanitize_filename};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn upload_id(raw: &str) -> Result<UploadId, UploadError> {
    UploadId::parse(raw).ok_or(UploadError::NotFound)
}

/// optional non-negative integer header; present but malformed is a 400
fn u64_header(headers: &HeaderMap, name: &str) -> Result<Option<u64>, UploadError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(parse_u64_header)
            .map(Some)
            .ok_or_else(|| UploadError::InvalidRequest(format!("invalid {name} header"))),
    }
}

fn is_offset_stream(headers: &HeaderMap) -> bool {
    header_str(headers, header::CONTENT_TYPE.as_str())
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
}

fn checksum(headers: &HeaderMap) -> Result<Option<Checksum>, UploadError> {
    header_str(headers, UPLOAD_CHECKSUM)
        .map(Checksum::parse)
        .transpose()
}

// advertise protocol capabilities
pub async fn options(State(state): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    set_header(&mut headers, TUS_VERSION, PROTOCOL_VERSION);
    set_header(&mut headers, TUS_EXTENSION, SUPPORTED_EXTENSIONS);
    set_header(&mut headers, TUS_CHECKSUM_ALGORITHM, CHECKSUM_ALGORITHMS);
    if let Some(max) = state.engine.config().max_size {
        set_header(&mut headers, TUS_MAX_SIZE, max);
    }
    (StatusCode::NO_CONTENT, headers).into_response()
}

// create a new upload, optionally with the first chunk in the body
pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, UploadError> {
    let length = u64_header(&headers, UPLOAD_LENGTH)?;
    let deferred = match header_str(&headers, UPLOAD_DEFER_LENGTH) {
        None => false,
        Some("1") => true,
        Some(other) => {
            return Err(UploadError::InvalidRequest(format!(
                "Upload-Defer-Length must be 1, got {other:?}"
            )));
        }
    };
    match (length, deferred) {
        (Some(_), true) => {
            return Err(UploadError::InvalidRequest(
                "Upload-Length and Upload-Defer-Length are mutually exclusive".to_string(),
            ));
        }
        (None, false) => {
            return Err(UploadError::InvalidRequest(
                "Upload-Length or Upload-Defer-Length is required".to_string(),
            ));
        }
        _ => {}
    }

    let metadata = match header_str(&headers, UPLOAD_METADATA) {
        Some(raw) => state.engine.parse_metadata(raw)?,
        None if headers.contains_key(UPLOAD_METADATA) => {
            return Err(UploadError::InvalidMetadata("header is not ascii".to_string()));
        }
        None => UploadMetadata::new(),
    };

    let initial = if body.is_empty() {
        None
    } else {
        if !is_offset_stream(&headers) {
            return Err(UploadError::UnsupportedMediaType);
        }
        Some(checksum(&headers)?)
    };

    let session = state.engine.create(length, metadata).await?;
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&state.upload_url(&session.id))
            .map_err(|e| UploadError::InvalidRequest(e.to_string()))?,
    );

    let mut expires_at = session.expires_at;
    if let Some(checksum) = initial {
        let mut req = PatchRequest::new(0, body);
        req.checksum = checksum;
        let offset = match state.engine.patch(&session.id, req).await {
            Ok(outcome) => {
                expires_at = outcome.expires_at;
                outcome.offset
            }
            Err(e) => {
                // the upload exists either way; the client resumes from HEAD
                tracing::warn!("Initial chunk for {} was not applied: {}", session.id, e);
                0
            }
        };
        set_header(&mut response_headers, UPLOAD_OFFSET, offset);
    }
    set_header(&mut response_headers, UPLOAD_EXPIRES, http_date(expires_at));

    Ok((StatusCode::CREATED, response_headers).into_response())
}

fn session_headers(session: &UploadSession) -> HeaderMap {
    let mut headers = HeaderMap::new();
    set_header(&mut headers, UPLOAD_OFFSET, session.offset);
    match session.total_length {
        Some(length) => set_header(&mut headers, UPLOAD_LENGTH, length),
        None => set_header(&mut headers, UPLOAD_DEFER_LENGTH, 1),
    }
    if !session.metadata.is_empty() {
        set_header(&mut headers, UPLOAD_METADATA, session.metadata.encode());
    }
    if !session.is_finalized() {
        set_header(&mut headers, UPLOAD_EXPIRES, http_date(session.expires_at));
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers
}

// current offset of an upload
pub async fn head_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, UploadError> {
    let session = state.engine.head(&upload_id(&id)?)?;
    Ok((StatusCode::OK, session_headers(&session)).into_response())
}

// append a chunk
pub async fn patch_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, UploadError> {
    let id = upload_id(&id)?;
    if !is_offset_stream(&headers) {
        return Err(UploadError::UnsupportedMediaType);
    }
    let expected_offset = u64_header(&headers, UPLOAD_OFFSET)?.ok_or_else(|| {
        UploadError::InvalidRequest("Upload-Offset header is required".to_string())
    })?;

    let req = PatchRequest {
        expected_offset,
        data: body,
        checksum: checksum(&headers)?,
        declared_length: u64_header(&headers, UPLOAD_LENGTH)?,
    };
    let outcome = state.engine.patch(&id, req).await?;

    let mut response_headers = HeaderMap::new();
    set_header(&mut response_headers, UPLOAD_OFFSET, outcome.offset);
    if !outcome.finalized {
        set_header(
            &mut response_headers,
            UPLOAD_EXPIRES,
            http_date(outcome.expires_at),
        );
    }
    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

// download received bytes, honoring a single Range
pub async fn get_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, UploadError> {
    let id = upload_id(&id)?;
    let range = header_str(&headers, header::RANGE.as_str());
    let download = state.engine.read(&id, range).await?;

    let mut response_headers = HeaderMap::new();
    let content_type = download
        .session
        .metadata
        .filetype()
        .and_then(|t| HeaderValue::from_str(t).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    response_headers.insert(header::CONTENT_TYPE, content_type);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(name) = download.session.metadata.filename() {
        let name = sanitize_filename(name);
        if !name.is_empty() {
            set_header(
                &mut response_headers,
                "content-disposition",
                format!("inline; filename=\"{name}\""),
            );
        }
    }

    let status = if download.partial {
        set_header(
            &mut response_headers,
            "content-range",
            format!(
                "bytes {}-{}/{}",
                download.start,
                download.end.saturating_sub(1),
                download.total
            ),
        );
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    set_header(&mut response_headers, "content-length", download.len());

    tracing::debug!(
        "📤 Serving {} bytes of upload {} ({}-{})",
        download.len(),
        id,
        download.start,
        download.end
    );
    Ok((status, response_headers, Body::from_stream(download.body)).into_response())
}

// terminate an upload; ids we never issued are already gone
pub async fn delete_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, UploadError> {
    match UploadId::parse(&id) {
        Some(id) => state.engine.terminate(&id).await?,
        None => tracing::debug!("Terminate for malformed upload id {:?}", id),
    }
    Ok(StatusCode::NO_CONTENT)
}

// get server statistics
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let stats = state.engine.stats();
    tracing::debug!("Stats: {:?}", stats);
    Json(StatsResponse {
        active_uploads: stats.active,
        finalized_uploads: stats.finalized,
        bytes_received: stats.bytes_received,
        backend: state.engine.backend_name().to_string(),
    })
}

// health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.store().health_check().await {
        Ok(()) => Json(serde_json::json!({
            "status": "healthy",
            "service": "tusk",
            "backend": state.engine.backend_name(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "service": "tusk",
                    "backend": state.engine.backend_name(),
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}
