//! Error handling for Camwatch Sync

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::models::{ApiError, ApiResponse};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Change feed connection dropped (recovered internally by retry + refetch)
    #[error("Transport lost: {0}")]
    TransportLost(String),

    /// A detection toggle is already in flight for this device
    #[error("Toggle already in flight for device {0}")]
    Busy(String),

    /// Authoritative store rejected a mutation
    #[error("Store write failed: {0}")]
    StoreWriteFailed(String),

    /// Best-effort detector call failed (logged, never surfaced)
    #[error("Detector unreachable: {0}")]
    DetectorUnreachable(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or malformed session
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Blob upload failed
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// Database read error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::TransportLost(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "TRANSPORT_LOST",
                msg.clone(),
            ),
            Error::Busy(device_id) => (
                StatusCode::CONFLICT,
                "TOGGLE_IN_FLIGHT",
                format!("Detection toggle already in progress for device {}", device_id),
            ),
            Error::StoreWriteFailed(msg) => (
                StatusCode::BAD_GATEWAY,
                "STORE_WRITE_FAILED",
                msg.clone(),
            ),
            Error::DetectorUnreachable(msg) => (
                StatusCode::BAD_GATEWAY,
                "DETECTOR_UNREACHABLE",
                msg.clone(),
            ),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            Error::UploadFailed(msg) => (StatusCode::BAD_GATEWAY, "UPLOAD_FAILED", msg.clone()),
            Error::Database(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                msg.clone(),
            ),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string()),
            Error::Io(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                e.to_string(),
            ),
            Error::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                msg.clone(),
            ),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
            Error::Sqlx(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                e.to_string(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(ApiResponse::<()>::error(ApiError {
            code: error_code.to_string(),
            message,
        }));

        (status, body).into_response()
    }
}
