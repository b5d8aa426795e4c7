//! HTTP API handlers for SurgeGate.
//!
//! Read endpoints are public; every mutation sits behind the admin token
//! (see [`crate::auth`]). The admission endpoint (`POST /api/traffic/state`)
//! follows the controller's failure semantics: it answers `allowed: true`
//! with a diagnostic reason rather than erroring.

use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::auth::{AdminAuth, require_admin};
use crate::blocklist::UnblockTarget;
use crate::controller::{AdmissionController, CheckMode};
use crate::error::AdminError;
use crate::model::{
    AdmissionOutcome, BlockRequest, BlockedIpsResponse, CheckResponse, ConfigKey, ConfigResponse,
    Decision, FailOpenReason, StateRequest, TrafficState, UnblockQuery,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: AdmissionController,
    pub admin: AdminAuth,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/api/traffic/state/reset", post(reset_state))
        .route("/api/traffic/config", post(update_config))
        .route("/api/traffic/blocked-ips", post(block_ip).delete(unblock_ip))
        .route_layer(middleware::from_fn_with_state(
            state.admin.clone(),
            require_admin,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/traffic/state", get(get_state).post(post_state))
        .route("/api/traffic/config", get(get_config))
        .route("/api/traffic/blocked-ips", get(list_blocked_ips))
        .merge(admin)
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /api/traffic/state - Current traffic state with decay applied.
///
/// Read-only: the decayed values are not written back.
#[instrument(skip(state))]
pub async fn get_state(State(state): State<AppState>) -> Json<TrafficState> {
    Json(state.controller.read(Utc::now()).await)
}

/// POST /api/traffic/state - Admission check and counter updates.
///
/// # Request Body
///
/// ```json
/// { "action": "check_and_increment", "client_ip": "203.0.113.9" }
/// ```
///
/// `action` is one of `check`, `check_and_increment`, `increment` or
/// `decrement`. The check actions answer with
/// `{allowed, reason?, warning?, state}`; the counter actions with
/// `{success}`.
#[instrument(skip(state, payload))]
pub async fn post_state(
    State(state): State<AppState>,
    payload: Result<Json<StateRequest>, JsonRejection>,
) -> Response {
    let now = Utc::now();

    let request = match payload {
        Ok(Json(request)) => request,
        Err(e) => {
            warn!(error = %e, "Unreadable admission request; admitting");
            let outcome = AdmissionOutcome {
                decision: Decision::Allow,
                fail_open: Some(FailOpenReason::Error),
                state: TrafficState::seed(now),
            };
            return Json(CheckResponse::from(outcome)).into_response();
        }
    };

    let client_ip = request.client_ip.as_deref();
    let controller = &state.controller;

    match request.action.as_str() {
        "check" => {
            let outcome = controller.check_client(client_ip, CheckMode::Check, now).await;
            Json(CheckResponse::from(outcome)).into_response()
        }
        "check_and_increment" => {
            let outcome = controller
                .check_client(client_ip, CheckMode::CheckAndIncrement, now)
                .await;
            Json(CheckResponse::from(outcome)).into_response()
        }
        "increment" => {
            let success = match controller.increment(now).await {
                Ok(updated) => updated.is_some(),
                Err(e) => {
                    warn!(error = %e, "Increment failed");
                    false
                }
            };
            Json(json!({ "success": success })).into_response()
        }
        "decrement" => {
            let success = match controller.decrement().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Decrement failed");
                    false
                }
            };
            Json(json!({ "success": success })).into_response()
        }
        other => {
            warn!(action = %other, "Unknown traffic action");
            AdminError::validation("Unknown action").into_response()
        }
    }
}

/// POST /api/traffic/state/reset - Restore the seed state (admin).
#[instrument(skip(state))]
pub async fn reset_state(State(state): State<AppState>) -> Result<Json<Value>, AdminError> {
    let reset = state.controller.reset(Utc::now()).await?;
    Ok(Json(json!({ "success": true, "state": reset })))
}

/// GET /api/traffic/config - Effective configuration, defaults merged in.
#[instrument(skip(state))]
pub async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        config: state.controller.config().await,
    })
}

/// POST /api/traffic/config - Update configuration values (admin).
///
/// # Request Body
///
/// ```json
/// { "config": { "spike_trigger_percentage": 150, "window_seconds": 30 } }
/// ```
///
/// Unknown keys, non-numeric or non-positive values, and a `baseline_alpha`
/// above 1 reject the whole update.
#[instrument(skip(state, payload))]
pub async fn update_config(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, AdminError> {
    let Json(body) = payload.map_err(|e| AdminError::validation(e.body_text()))?;
    let updates = parse_config_updates(&body)?;

    let config = state.controller.update_config(&updates).await?;
    Ok(Json(json!({ "success": true, "config": config })))
}

/// Validate a `{config: {key: number}}` body into typed updates.
pub fn parse_config_updates(body: &Value) -> Result<Vec<(ConfigKey, f64)>, AdminError> {
    let entries = body
        .get("config")
        .and_then(Value::as_object)
        .ok_or_else(|| AdminError::validation("Config object required"))?;

    entries
        .iter()
        .map(|(key, value)| {
            let config_key = ConfigKey::parse(key)
                .ok_or_else(|| AdminError::validation(format!("Unknown config key: {key}")))?;
            let number = value
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| AdminError::validation(format!("{key} must be a finite number")))?;
            if number <= 0.0 {
                return Err(AdminError::validation(format!("{key} must be positive")));
            }
            if config_key == ConfigKey::BaselineAlpha && number > 1.0 {
                return Err(AdminError::validation("baseline_alpha must be at most 1"));
            }
            Ok((config_key, number))
        })
        .collect()
}

/// GET /api/traffic/blocked-ips - Active blocks, newest first.
#[instrument(skip(state))]
pub async fn list_blocked_ips(State(state): State<AppState>) -> Json<BlockedIpsResponse> {
    let blocked_ips = match state.controller.blocklist().list_active(Utc::now()).await {
        Ok(blocks) => blocks,
        Err(e) => {
            warn!(error = %e, "Failed to list blocked addresses");
            Vec::new()
        }
    };

    info!(count = blocked_ips.len(), "Blocked addresses listed");
    Json(BlockedIpsResponse { blocked_ips })
}

/// POST /api/traffic/blocked-ips - Block an address (admin).
///
/// # Request Body
///
/// ```json
/// { "ip_address": "203.0.113.9", "reason": "scraping", "is_permanent": false, "expires_hours": 6 }
/// ```
#[instrument(skip(state, payload))]
pub async fn block_ip(
    State(state): State<AppState>,
    payload: Result<Json<BlockRequest>, JsonRejection>,
) -> Result<Json<Value>, AdminError> {
    let Json(request) = payload.map_err(|e| AdminError::validation(e.body_text()))?;

    let blocked = state
        .controller
        .blocklist()
        .block(&request, Utc::now())
        .await?;
    Ok(Json(json!({ "success": true, "blocked_ip": blocked })))
}

/// DELETE /api/traffic/blocked-ips?ip=…|?id=… - Remove a block (admin).
#[instrument(skip(state))]
pub async fn unblock_ip(
    State(state): State<AppState>,
    query: Result<Query<UnblockQuery>, QueryRejection>,
) -> Result<Json<Value>, AdminError> {
    let Query(query) = query.map_err(|e| AdminError::validation(e.body_text()))?;
    let target = UnblockTarget::from_query(&query)?;
    let removed = state.controller.blocklist().unblock(&target).await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_updates() {
        let updates = parse_config_updates(&json!({
            "config": { "spike_trigger_percentage": 150, "window_seconds": 30.5 }
        }))
        .unwrap();

        assert_eq!(updates.len(), 2);
        assert!(updates.contains(&(ConfigKey::SpikeTriggerPercentage, 150.0)));
        assert!(updates.contains(&(ConfigKey::WindowSeconds, 30.5)));

        let updates = parse_config_updates(&json!({ "config": { "baseline_alpha": 1 } })).unwrap();
        assert_eq!(updates, vec![(ConfigKey::BaselineAlpha, 1.0)]);
    }

    #[test]
    fn test_parse_config_rejects_bad_bodies() {
        for body in [
            json!({}),
            json!({ "config": 5 }),
            json!({ "config": [1, 2] }),
            json!({ "config": { "nonsense": 1 } }),
            json!({ "config": { "window_seconds": "60" } }),
            json!({ "config": { "window_seconds": null } }),
            json!({ "config": { "window_seconds": 0 } }),
            json!({ "config": { "max_concurrent_users": -5 } }),
            json!({ "config": { "baseline_alpha": 1.5 } }),
        ] {
            let err = parse_config_updates(&body).unwrap_err();
            assert!(matches!(err, AdminError::Validation(_)), "{body}");
        }
    }
}
