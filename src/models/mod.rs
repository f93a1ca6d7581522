//! Shared data models
//!
//! Entities mirrored from the authoritative store plus API wrappers.

mod entities;

pub use entities::*;

use serde::{Deserialize, Serialize};

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ApiError) -> ApiResponse<T> {
        ApiResponse {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// API error
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store_backend: String,
    pub live_subscriptions: usize,
    pub connected_clients: u64,
}
