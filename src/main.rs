use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tusk::config::Config;
use tusk::protocol::UploadEngine;
use tusk::server::{
    build_router, print_startup_banner, spawn_event_logger, spawn_gc, start_server,
    with_rate_limit,
};
use tusk::state::AppState;
use tusk::store;

// use mimalloc as the global allocator
// 10-20% faster than system allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    // load .env file if it exists (fails silently if not found)
    let _ = dotenvy::dotenv();

    // initialize tracing before config so its warnings are visible
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // load configuration from environment variables
    let config = Config::from_env();

    // build tokio runtime with configured worker threads
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let code = runtime.block_on(async {
        let store = match store::from_config(&config.storage).await {
            Ok(store) => store,
            Err(e) => {
                tracing::error!("Failed to initialize storage: {}", e);
                return 1;
            }
        };
        if let Err(e) = store.health_check().await {
            tracing::warn!("⚠️  Storage health check failed, continuing: {}", e);
        }

        let engine = Arc::new(UploadEngine::new(store, config.engine_config()));
        if let Err(e) = engine.restore().await {
            tracing::warn!("⚠️  Failed to restore persisted uploads: {}", e);
        }
        let state = Arc::new(AppState::new(engine.clone(), config.public_url.clone()));
        let app = with_rate_limit(build_router(state, &config), &config);

        let addr = match config.host.parse::<std::net::IpAddr>() {
            Ok(ip) => SocketAddr::from((ip, config.port)),
            Err(e) => {
                tracing::error!("Invalid HOST {:?}: {}", config.host, e);
                return 1;
            }
        };

        // print startup information
        print_startup_banner(&config, &engine);

        let shutdown = CancellationToken::new();
        let gc = spawn_gc(
            engine.clone(),
            Duration::from_secs(config.gc_interval_secs),
            shutdown.clone(),
        );
        let events = spawn_event_logger(&engine);

        let result = start_server(app, addr).await;
        shutdown.cancel();
        let _ = gc.await;
        events.abort();

        match result {
            Ok(()) => {
                tracing::info!("👋 Server stopped");
                0
            }
            Err(e) => {
                tracing::error!("Server error: {}", e);
                1
            }
        }
    });

    std::process::exit(code);
}
