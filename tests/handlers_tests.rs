use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use std::sync::Arc;
use tower::util::ServiceExt;
use tusk::config::{Config, StorageConfig, MAX_UPLOAD_TTL_SECS};
use tusk::handlers::{get_stats, health_check};
use tusk::models::ErrorResponse;
use tusk::protocol::{Checksum, EngineConfig, UploadEngine};
use tusk::server::build_router;
use tusk::state::AppState;
use tusk::store::MemoryStore;

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        public_url: None,
        storage: StorageConfig::Memory,
        max_upload_size: Some(1024),
        max_chunk_size: 64,
        max_metadata_size: 1024,
        upload_ttl_secs: 60,
        gc_interval_secs: 60,
        worker_threads: 1,
        api_key_hash: None,
        cors_origins: vec!["http://localhost:3000".to_string()],
        rate_limit_per_second: 10,
        rate_limit_burst: 10,
    }
}

fn test_state(config: &Config) -> Arc<AppState> {
    let engine = UploadEngine::new(Arc::new(MemoryStore::new()), config.engine_config());
    Arc::new(AppState::new(Arc::new(engine), config.public_url.clone()))
}

fn test_app() -> (Router, Arc<AppState>) {
    let config = test_config();
    let state = test_state(&config);
    (build_router(state.clone(), &config), state)
}

fn tus(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Tus-Resumable", "1.0.0")
}

fn patch(uri: &str, offset: u64, body: &'static [u8]) -> Request<Body> {
    tus(Method::PATCH, uri)
        .header("Content-Type", "application/offset+octet-stream")
        .header("Upload-Offset", offset.to_string())
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

fn header<'a>(response: &'a Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing {name}"))
        .to_str()
        .unwrap()
}

async fn error_body(response: Response) -> ErrorResponse {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn create(app: &Router, length: u64) -> String {
    let response = send(
        app,
        tus(Method::POST, "/files")
            .header("Upload-Length", length.to_string())
            // filename "a.mp4"
            .header("Upload-Metadata", "filename YS5tcDQ=")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    header(&response, "location").to_string()
}

#[tokio::test]
async fn test_options_advertises_capabilities() {
    let (app, _) = test_app();
    let response = send(
        &app,
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/files")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "tus-resumable"), "1.0.0");
    assert_eq!(header(&response, "tus-version"), "1.0.0");
    assert_eq!(header(&response, "tus-max-size"), "1024");
    assert_eq!(header(&response, "tus-checksum-algorithm"), "sha256");
    let extensions = header(&response, "tus-extension");
    for ext in ["creation", "creation-defer-length", "termination", "expiration", "checksum"] {
        assert!(extensions.split(',').any(|e| e == ext), "missing {ext}");
    }
}

#[tokio::test]
async fn test_full_upload_flow() {
    let (app, state) = test_app();

    let location = create(&app, 10).await;
    assert!(location.starts_with("/files/"));

    let response = send(&app, patch(&location, 0, b"012345")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), "6");
    assert!(header(&response, "upload-expires").ends_with("GMT"));

    let response = send(&app, tus(Method::HEAD, &location).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "upload-offset"), "6");
    assert_eq!(header(&response, "upload-length"), "10");
    assert_eq!(header(&response, "upload-metadata"), "filename YS5tcDQ=");
    assert_eq!(header(&response, "cache-control"), "no-store");

    let response = send(&app, patch(&location, 6, b"6789")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), "10");

    let response = send(&app, tus(Method::GET, &location).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header(&response, "content-disposition"),
        "inline; filename=\"a.mp4\""
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"0123456789");

    let stats = get_stats(State(state)).await;
    assert_eq!(stats.0.finalized_uploads, 1);
    assert_eq!(stats.0.bytes_received, 10);
}

#[tokio::test]
async fn test_offset_mismatch_reports_current_offset() {
    let (app, _) = test_app();
    let location = create(&app, 10).await;
    send(&app, patch(&location, 0, b"0123")).await;

    let response = send(&app, patch(&location, 2, b"xx")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(header(&response, "upload-offset"), "4");
    assert_eq!(error_body(response).await.code, "offset_mismatch");
}

#[tokio::test]
async fn test_patch_requires_offset_stream() {
    let (app, _) = test_app();
    let location = create(&app, 10).await;

    let response = send(
        &app,
        tus(Method::PATCH, &location)
            .header("Content-Type", "application/octet-stream")
            .header("Upload-Offset", "0")
            .body(Body::from("abc"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = send(
        &app,
        tus(Method::PATCH, &location)
            .header("Content-Type", "application/offset+octet-stream")
            .body(Body::from("abc"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_protocol_version() {
    let (app, _) = test_app();
    let response = send(
        &app,
        Request::builder()
            .method(Method::POST)
            .uri("/files")
            .header("Upload-Length", "10")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(header(&response, "tus-version"), "1.0.0");
}

#[tokio::test]
async fn test_unknown_upload() {
    let (app, _) = test_app();
    for uri in ["/files/0123456789abcdef0123456789abcdef", "/files/not-an-id"] {
        let response = send(&app, tus(Method::HEAD, uri).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_create_validation() {
    let (app, _) = test_app();

    // no length at all
    let response = send(&app, tus(Method::POST, "/files").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // both
    let response = send(
        &app,
        tus(Method::POST, "/files")
            .header("Upload-Length", "10")
            .header("Upload-Defer-Length", "1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // bad metadata
    let response = send(
        &app,
        tus(Method::POST, "/files")
            .header("Upload-Length", "10")
            .header("Upload-Metadata", "filename not*base64")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_body(response).await.code, "invalid_metadata");

    // over the size limit
    let response = send(
        &app,
        tus(Method::POST, "/files")
            .header("Upload-Length", "4096")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_deferred_length_over_http() {
    let (app, _) = test_app();
    let response = send(
        &app,
        tus(Method::POST, "/files")
            .header("Upload-Defer-Length", "1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let location = header(&response, "location").to_string();

    let response = send(&app, tus(Method::HEAD, &location).body(Body::empty()).unwrap()).await;
    assert_eq!(header(&response, "upload-defer-length"), "1");

    let response = send(
        &app,
        tus(Method::PATCH, &location)
            .header("Content-Type", "application/offset+octet-stream")
            .header("Upload-Offset", "0")
            .header("Upload-Length", "3")
            .body(Body::from("abc"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), "3");

    let response = send(&app, tus(Method::HEAD, &location).body(Body::empty()).unwrap()).await;
    assert_eq!(header(&response, "upload-length"), "3");
}

#[tokio::test]
async fn test_creation_with_upload() {
    let (app, _) = test_app();
    let response = send(
        &app,
        tus(Method::POST, "/files")
            .header("Upload-Length", "10")
            .header("Content-Type", "application/offset+octet-stream")
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header(&response, "upload-offset"), "5");
}

#[tokio::test]
async fn test_terminate() {
    let (app, _) = test_app();
    let location = create(&app, 10).await;

    let response = send(&app, tus(Method::DELETE, &location).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(&app, tus(Method::HEAD, &location).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, patch(&location, 0, b"abc")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let (app, _) = test_app();
    let location = create(&app, 10).await;

    // a retried DELETE after a lost response
    for _ in 0..2 {
        let response =
            send(&app, tus(Method::DELETE, &location).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    for uri in ["/files/0123456789abcdef0123456789abcdef", "/files/not-an-id"] {
        let response = send(&app, tus(Method::DELETE, uri).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT, "{uri}");
        assert_eq!(header(&response, "tus-resumable"), "1.0.0");
    }

    let response = send(&app, tus(Method::HEAD, &location).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_plain_http_download() {
    let (app, _) = test_app();
    let location = create(&app, 6).await;
    let response = send(&app, patch(&location, 0, b"abc")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // no Tus-Resumable, as a browser or curl would send it
    let response = send(
        &app,
        Request::builder()
            .uri(location.as_str())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "tus-resumable"), "1.0.0");
    assert_eq!(header(&response, "content-length"), "3");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"abc");

    let response = send(
        &app,
        Request::builder()
            .method(Method::HEAD)
            .uri(location.as_str())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn test_checksum_mismatch() {
    let (app, _) = test_app();
    let location = create(&app, 10).await;

    let response = send(
        &app,
        tus(Method::PATCH, &location)
            .header("Content-Type", "application/offset+octet-stream")
            .header("Upload-Offset", "0")
            .header("Upload-Checksum", Checksum::sha256(b"nope").to_header())
            .body(Body::from("abc"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status().as_u16(), 460);

    let response = send(
        &app,
        tus(Method::PATCH, &location)
            .header("Content-Type", "application/offset+octet-stream")
            .header("Upload-Offset", "0")
            .header("Upload-Checksum", "crc32 AAAA")
            .body(Body::from("abc"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_range_request() {
    let (app, _) = test_app();
    let location = create(&app, 10).await;
    send(&app, patch(&location, 0, b"0123456789")).await;

    let response = send(
        &app,
        tus(Method::GET, &location)
            .header("Range", "bytes=2-4")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&response, "content-range"), "bytes 2-4/10");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"234");

    let response = send(
        &app,
        tus(Method::GET, &location)
            .header("Range", "bytes=20-")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn test_chunk_over_body_limit() {
    let (app, _) = test_app();
    let location = create(&app, 1000).await;
    let response = send(&app, patch(&location, 0, &[7u8; 100])).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_public_url_in_location() {
    let mut config = test_config();
    config.public_url = Some("https://uploads.example.com".to_string());
    let app = build_router(test_state(&config), &config);

    let location = create(&app, 10).await;
    assert!(location.starts_with("https://uploads.example.com/files/"));
}

#[tokio::test]
async fn test_api_key_when_configured() {
    let mut config = test_config();
    config.api_key_hash = Some(Config::hash_api_key("letmein"));
    let app = build_router(test_state(&config), &config);

    let response = send(
        &app,
        tus(Method::POST, "/files")
            .header("Upload-Length", "10")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(header(&response, "tus-resumable"), "1.0.0");

    let response = send(
        &app,
        tus(Method::POST, "/files")
            .header("Upload-Length", "10")
            .header("X-API-Key", "letmein")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_health_check() {
    let config = test_config();
    let state = test_state(&config);
    let response = health_check(State(state)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["backend"], "memory");
}

#[tokio::test]
async fn test_stats_without_protocol_header() {
    let (app, _) = test_app();
    create(&app, 10).await;

    let response = send(
        &app,
        Request::builder().uri("/stats").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["active_uploads"], 1);
    assert_eq!(stats["backend"], "memory");
}

#[test]
fn test_engine_config_from_config() {
    let config = test_config();
    let engine: EngineConfig = config.engine_config();
    assert_eq!(engine.max_size, Some(1024));
    assert_eq!(engine.max_metadata_size, 1024);
}

#[tokio::test]
async fn test_oversized_ttl_is_capped() {
    let mut config = test_config();
    config.upload_ttl_secs = u64::MAX;
    let engine_config = config.engine_config();
    assert_eq!(
        engine_config.upload_ttl,
        chrono::TimeDelta::seconds(MAX_UPLOAD_TTL_SECS as i64)
    );

    // expiry dates stay representable
    let (app, _) = {
        let state = test_state(&config);
        (build_router(state.clone(), &config), state)
    };
    let location = create(&app, 10).await;
    let response = send(&app, patch(&location, 0, b"abc")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), "3");
}
