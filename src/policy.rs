//! Admission policy.
//!
//! A pure mapping from `(state, config)` to a [`Decision`]. Rules are
//! evaluated in a fixed order and the first match wins:
//!
//! 1. `spike_ratio >= hard_overload_percentage` or `is_overloaded` → reject `hard_overload`
//! 2. `concurrent_users >= max_concurrent_users` → reject `max_concurrent`
//! 3. `spike_ratio >= spike_trigger_percentage` → allow with warning `spike_detected`
//! 4. otherwise → allow

use axum::http::StatusCode;

use crate::model::{Decision, RejectReason, TrafficConfig, TrafficState, WarningReason};

/// Seconds a rejected client is told to wait before retrying.
pub const RETRY_AFTER_SECS: u64 = 10;

/// Decide whether a request may proceed under the given load.
pub fn decide(state: &TrafficState, config: &TrafficConfig) -> Decision {
    if state.spike_ratio >= config.hard_overload_percentage || state.is_overloaded {
        return Decision::Reject(RejectReason::HardOverload);
    }

    if state.concurrent_users as f64 >= config.max_concurrent_users {
        return Decision::Reject(RejectReason::MaxConcurrent);
    }

    if state.spike_ratio >= config.spike_trigger_percentage {
        return Decision::AllowWithWarning(WarningReason::SpikeDetected);
    }

    Decision::Allow
}

/// HTTP status a rejection is rendered with.
pub fn reject_status(reason: RejectReason) -> StatusCode {
    match reason {
        RejectReason::MaxConcurrent => StatusCode::TOO_MANY_REQUESTS,
        RejectReason::HardOverload | RejectReason::Blocked => StatusCode::SERVICE_UNAVAILABLE,
    }
}
