//! Camwatch Sync - dashboard state synchronization server
//!
//! Main entry point.

use camwatch_sync::{
    state::{AppConfig, AppState},
    web_api,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camwatch_sync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Camwatch Sync v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        store_backend = ?config.store_backend,
        detector_url = %config.detector_url,
        storage_bucket = %config.storage_bucket,
        poll_interval_secs = config.poll_interval.as_secs(),
        max_upload_bytes = config.upload.max_bytes,
        "Configuration loaded"
    );

    let state = AppState::build(config).await?;
    tracing::info!(backend = state.store.backend(), "Components initialized");

    // Cache changes -> WebSocket clients
    let _forwarder = state
        .realtime
        .clone()
        .forward_changes(state.reconciler.subscribe_changes());

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
