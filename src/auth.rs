//! Admin token gate.
//!
//! Admin routes require a shared token in `Authorization: Bearer <token>`
//! or `X-Admin-Token: <token>`. Issuing and rotating tokens happens
//! elsewhere; this layer only compares.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::AdminError;

/// Header carrying the admin token when `Authorization` is not used.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Token used when none is configured. Logged as a warning at startup.
pub const DEV_ADMIN_TOKEN: &str = "surgegate-dev-token";

#[derive(Clone)]
pub struct AdminAuth {
    token: Arc<str>,
}

impl AdminAuth {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Whether `provided` matches the configured token, compared in constant time.
    pub fn accepts(&self, provided: &str) -> bool {
        let expected = self.token.as_bytes();
        let provided = provided.as_bytes();
        expected.len() == provided.len() && bool::from(expected.ct_eq(provided))
    }
}

/// Pull the admin token out of the request headers.
pub fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    bearer.or_else(|| {
        headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
    })
}

/// Middleware rejecting requests without a valid admin token.
///
/// # Example
/// ```ignore
/// let admin = Router::new()
///     .route("/api/traffic/config", post(update_config))
///     .route_layer(middleware::from_fn_with_state(auth, require_admin));
/// ```
pub async fn require_admin(
    State(auth): State<AdminAuth>,
    request: Request,
    next: Next,
) -> Result<Response, AdminError> {
    let authorized = token_from_headers(request.headers()).map(|token| auth.accepts(token.trim()));

    match authorized {
        Some(true) => Ok(next.run(request).await),
        Some(false) => {
            warn!(path = %request.uri().path(), "Rejected admin request with invalid token");
            Err(AdminError::Unauthorized)
        }
        None => Err(AdminError::Unauthorized),
    }
}
