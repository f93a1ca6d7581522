//! Session context
//!
//! The current user travels explicitly into every operation that needs it.
//! Authentication happens upstream; the HTTP layer only reads the user id
//! the gateway forwards in `x-user-id`.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::Error;

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Per-request session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionContext {
    pub user_id: String,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    /// Ownership check used before any mutation of a user's rows
    pub fn owns(&self, owner_id: &str) -> bool {
        self.user_id == owner_id
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for SessionContext
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Unauthorized(format!("missing {} header", USER_ID_HEADER)))?;

        Ok(SessionContext::new(user_id))
    }
}
