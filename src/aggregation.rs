//! Rate aggregation for the traffic state.
//!
//! Converts the raw window counters into a request rate, compares it to the
//! learned baseline and folds it into the baseline's moving average.

use chrono::{DateTime, Utc};

use crate::model::{BASELINE_FLOOR, DEFAULT_BASELINE_TRAFFIC, TrafficConfig, TrafficState};

/// Requests per second observed in the current window.
pub fn current_rate(request_count_window: i64, window_seconds: f64) -> f64 {
    if window_seconds <= 0.0 {
        return 0.0;
    }
    request_count_window.max(0) as f64 / window_seconds
}

/// Current rate as a percentage of the baseline; 0 when there is no baseline.
pub fn spike_ratio(current_traffic: f64, baseline_traffic: f64) -> f64 {
    if baseline_traffic <= 0.0 {
        return 0.0;
    }
    current_traffic / baseline_traffic * 100.0
}

/// The baseline to compare against. An unset or corrupt value re-seeds to the default.
pub fn effective_baseline(stored: f64) -> f64 {
    if stored.is_finite() && stored > 0.0 {
        stored
    } else {
        DEFAULT_BASELINE_TRAFFIC
    }
}

/// One step of the baseline's exponential moving average.
///
/// A step that would land at or below [`BASELINE_FLOOR`] is discarded and
/// the previous baseline is kept.
pub fn next_baseline(baseline: f64, current_traffic: f64, alpha: f64) -> f64 {
    let averaged = baseline * (1.0 - alpha) + current_traffic * alpha;
    if averaged > BASELINE_FLOOR {
        averaged
    } else {
        baseline
    }
}

/// Recompute every derived field after the window counters moved.
///
/// The spike ratio is measured against the baseline as it was *before* this
/// observation; the returned state carries the updated baseline.
pub fn record_counts(
    previous: &TrafficState,
    request_count_window: i64,
    concurrent_users: i64,
    config: &TrafficConfig,
    now: DateTime<Utc>,
) -> TrafficState {
    let current_traffic = current_rate(request_count_window, config.window_seconds);
    let baseline = effective_baseline(previous.baseline_traffic);
    let spike_ratio = spike_ratio(current_traffic, baseline);
    let is_overloaded = spike_ratio >= config.hard_overload_percentage;

    TrafficState {
        baseline_traffic: next_baseline(baseline, current_traffic, config.baseline_alpha),
        current_traffic,
        spike_ratio,
        request_count_window: request_count_window.max(0),
        concurrent_users: concurrent_users.max(0),
        is_overloaded,
        recovery_progress: if is_overloaded { 0.0 } else { 1.0 },
        last_updated: now,
    }
}
