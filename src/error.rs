//! Errors surfaced by the admin operations.
//!
//! The admission path never returns these: it absorbs every failure and
//! admits the request instead. Operator-driven calls (config updates,
//! blocking and unblocking) fail loudly.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdminError {
    /// The request was well-formed HTTP but its content is unusable.
    #[error("{0}")]
    Validation(String),

    /// Missing or wrong admin token.
    #[error("admin token missing or invalid")]
    Unauthorized,

    /// The store failed while serving an admin request.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl AdminError {
    pub fn validation(message: impl Into<String>) -> Self {
        AdminError::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AdminError::Validation(_) => StatusCode::BAD_REQUEST,
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        if let AdminError::Storage(e) = &self {
            tracing::error!(error = %e, "Admin operation failed");
        }
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
