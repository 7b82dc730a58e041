use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method},
    routing::{get, head, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::config::{Config, StorageConfig};
use crate::handlers::{
    create_upload, delete_upload, get_stats, get_upload, head_upload, health_check, options,
    patch_upload,
};
use crate::headers;
use crate::middleware::{add_security_headers, require_tus_resumable, validate_api_key};
use crate::protocol::{UploadEngine, UploadEvent};
use crate::state::AppState;
use crate::utils::shutdown_signal;

fn cors_layer(config: &Config) -> CorsLayer {
    let origin = if config.cors_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        AllowOrigin::list(origins)
    };

    // browsers only let scripts read headers listed here
    let exposed = [
        headers::TUS_RESUMABLE,
        headers::TUS_VERSION,
        headers::TUS_EXTENSION,
        headers::TUS_MAX_SIZE,
        headers::TUS_CHECKSUM_ALGORITHM,
        headers::UPLOAD_OFFSET,
        headers::UPLOAD_LENGTH,
        headers::UPLOAD_DEFER_LENGTH,
        headers::UPLOAD_METADATA,
        headers::UPLOAD_EXPIRES,
        "location",
    ]
    .into_iter()
    .map(HeaderName::from_static)
    .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_origin(origin)
        .allow_headers(Any)
        .expose_headers(exposed)
        .max_age(Duration::from_secs(24 * 60 * 60))
}

/// build the upload router (without rate limiting, see [`with_rate_limit`])
pub fn build_router(state: Arc<AppState>, config: &Config) -> Router {
    tracing::debug!(
        "Building upload router with max chunk size: {} bytes",
        config.max_chunk_size
    );

    let mut router = Router::new()
        .route("/files", post(create_upload).options(options))
        .route(
            "/files/:id",
            head(head_upload)
                .patch(patch_upload)
                .get(get_upload)
                .delete(delete_upload)
                .options(options),
        )
        .route("/stats", get(get_stats))
        .route("/health", get(health_check))
        .with_state(state);

    // inside the version gate, so rejections still carry Tus-Resumable
    if let Some(hash) = &config.api_key_hash {
        router = router.layer(axum::middleware::from_fn_with_state(
            Arc::new(hash.clone()),
            validate_api_key,
        ));
    }

    router
        .layer(axum::middleware::from_fn(require_tus_resumable))
        .layer(axum::middleware::from_fn(add_security_headers))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_chunk_size))
        .layer(cors_layer(config))
        .layer(TraceLayer::new_for_http())
}

/// per client ip rate limiting; needs the router served with connect info
pub fn with_rate_limit(router: Router, config: &Config) -> Router {
    let period_ms = (1000 / config.rate_limit_per_second.max(1)).max(1);
    let Some(governor_conf) = GovernorConfigBuilder::default()
        .per_millisecond(period_ms)
        .burst_size(config.rate_limit_burst)
        .finish()
    else {
        tracing::warn!("⚠️  Invalid rate limit settings, serving without rate limiting");
        return router;
    };

    router.layer(GovernorLayer {
        config: Arc::new(governor_conf),
    })
}

/// Sweep expired uploads every `interval` until `shutdown` fires.
pub fn spawn_gc(
    engine: Arc<UploadEngine>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    engine.sweep_expired(chrono::Utc::now()).await;
                }
            }
        }
        tracing::debug!("Expiry sweeper stopped");
    })
}

/// Log lifecycle events. Stands in for the attachment library that would
/// pick up finalized blobs.
pub fn spawn_event_logger(engine: &UploadEngine) -> JoinHandle<()> {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UploadEvent::Finalized { session }) => {
                    let stored = session.stored.as_ref().map(|b| b.key.as_str());
                    tracing::info!(
                        upload_id = %session.id,
                        size = session.offset,
                        stored = stored.unwrap_or("-"),
                        filename = session.metadata.filename().unwrap_or("-"),
                        "upload ready for promotion"
                    );
                }
                Ok(event) => tracing::debug!("Upload event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event logger lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// serve until ctrl-c / SIGTERM
pub async fn start_server(app: Router, addr: SocketAddr) -> std::io::Result<()> {
    tracing::info!("Starting server...");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!("Listener bound to {}", listener.local_addr()?);

    tracing::info!("Server running and ready to accept connections");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .tcp_nodelay(true)
    .await
}

/// print startup banner with server info
pub fn print_startup_banner(config: &Config, engine: &UploadEngine) {
    tracing::info!("Tusk starting...");
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("📡 TUS ENDPOINT: http://{}:{}/files", config.host, config.port);
    if let Some(public_url) = &config.public_url {
        tracing::info!("🌍 Public url: {}/files", public_url);
    }
    match &config.storage {
        StorageConfig::Local { root } => tracing::info!(
            "📁 Storing uploads in: {:?}",
            root.canonicalize().unwrap_or(root.clone())
        ),
        StorageConfig::S3 { bucket, .. } => tracing::info!("🪣 Storing uploads in bucket: {}", bucket),
        StorageConfig::Remote { endpoint, .. } => {
            tracing::info!("🔁 Proxying uploads to: {}", endpoint)
        }
        StorageConfig::Memory => tracing::info!("🧠 Storing uploads in memory"),
    }
    tracing::info!(
        "⏳ Uploads expire after {}s idle, swept every {}s",
        config.upload_ttl_secs,
        config.gc_interval_secs
    );
    tracing::info!("🔧 Backend: {}", engine.backend_name());
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
