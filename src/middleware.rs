use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::config::Config;
use crate::error::UploadError;
use crate::headers::{API_KEY, PROTOCOL_VERSION, TUS_RESUMABLE};

/// paths that are not part of the upload protocol
fn is_service_path(path: &str) -> bool {
    matches!(path, "/health" | "/stats")
}

/// Every protocol request must carry `Tus-Resumable: 1.0.0`; every response
/// carries it back. OPTIONS and plain GET downloads (browser previews,
/// HTTP downloaders) are exempt.
pub async fn require_tus_resumable(req: Request<Body>, next: Next) -> Response {
    let exempt = matches!(*req.method(), Method::OPTIONS | Method::GET)
        || is_service_path(req.uri().path());

    let mut response = if exempt {
        next.run(req).await
    } else {
        let version = req
            .headers()
            .get(TUS_RESUMABLE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match version.as_deref() {
            Some(PROTOCOL_VERSION) => next.run(req).await,
            Some(other) => UploadError::UnsupportedVersion(other.to_string()).into_response(),
            None => {
                UploadError::UnsupportedVersion("missing Tus-Resumable".to_string()).into_response()
            }
        }
    };

    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(PROTOCOL_VERSION));
    response
}

// api key validation, only mounted when UPLOAD_API_KEY is set
pub async fn validate_api_key(
    State(api_key_hash): State<Arc<String>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    // preflight and health checks never carry credentials
    if req.method() == Method::OPTIONS || req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let provided_key = req
        .headers()
        .get(API_KEY)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Missing X-API-Key header");
            StatusCode::UNAUTHORIZED
        })?;

    // hash the provided key and compare
    let provided_hash = Config::hash_api_key(provided_key);

    if provided_hash != *api_key_hash {
        tracing::warn!("🚫 Invalid API key attempt");
        return Err(StatusCode::UNAUTHORIZED);
    }

    tracing::debug!("API key validated successfully");
    Ok(next.run(req).await)
}

pub async fn add_security_headers(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; sandbox"),
    );

    response
}
