//! WebAPI - REST and WebSocket Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes for devices, notifications and analysis jobs
//! - Session extraction and response formatting
//! - WebSocket view activation and change distribution

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_backend: state.store.backend().to_string(),
        live_subscriptions: state.subscriptions.active_count(),
        connected_clients: state.realtime.connection_count(),
    };

    Json(response)
}
