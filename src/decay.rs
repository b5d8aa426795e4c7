//! Lazy time decay of the traffic state.
//!
//! No timer or background task exists. Every read path fetches the stored
//! row and brings it up to `now` with [`decay`] before using it, so a stale
//! row can never keep rejecting traffic after load has subsided.

use chrono::{DateTime, Utc};

use crate::model::TrafficState;

/// Idle time after which the concurrency gauge starts to decay.
const CONCURRENCY_DECAY_AFTER_SECS: f64 = 5.0;

/// The concurrency gauge halves every this many idle seconds.
const CONCURRENCY_HALF_LIFE_SECS: f64 = 10.0;

/// Seconds elapsed between the last write and `now`, clamped at zero.
pub fn elapsed_seconds(state: &TrafficState, now: DateTime<Utc>) -> f64 {
    let millis = (now - state.last_updated).num_milliseconds();
    (millis as f64 / 1000.0).max(0.0)
}

/// Bring a stored state up to `now`.
///
/// - After more than 5 idle seconds, `concurrent_users` decays by half every
///   10 seconds (floored). Lost completion calls cannot inflate it forever.
/// - Once a full window has elapsed, the window counters and derived rates
///   reset to zero and the overload flag clears.
///
/// `last_updated` is left untouched: decayed values are a view of the row,
/// not a new observation.
pub fn decay(state: &TrafficState, now: DateTime<Utc>, window_seconds: f64) -> TrafficState {
    let mut decayed = state.clone();
    let elapsed = elapsed_seconds(state, now);

    if elapsed > CONCURRENCY_DECAY_AFTER_SECS {
        let factor = 0.5_f64.powf(elapsed / CONCURRENCY_HALF_LIFE_SECS);
        decayed.concurrent_users = (state.concurrent_users.max(0) as f64 * factor).floor() as i64;
    }

    if elapsed >= window_seconds {
        decayed.request_count_window = 0;
        decayed.current_traffic = 0.0;
        decayed.spike_ratio = 0.0;
        decayed.is_overloaded = false;
        decayed.recovery_progress = 1.0;
    }

    decayed
}

/// Whether decay changed any persisted counter.
pub fn counters_changed(before: &TrafficState, after: &TrafficState) -> bool {
    before.concurrent_users != after.concurrent_users
        || before.request_count_window != after.request_count_window
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn busy_state(last_updated: DateTime<Utc>) -> TrafficState {
        TrafficState {
            baseline_traffic: 12.0,
            current_traffic: 8.3,
            spike_ratio: 250.0,
            request_count_window: 500,
            concurrent_users: 400,
            is_overloaded: true,
            recovery_progress: 0.0,
            last_updated,
        }
    }

    #[test]
    fn test_zero_elapsed_is_identity() {
        let now = Utc::now();
        let state = busy_state(now);

        assert_eq!(decay(&state, now, 60.0), state);
    }

    #[test]
    fn test_short_idle_leaves_state_alone() {
        let now = Utc::now();
        let state = busy_state(now - Duration::seconds(5));

        assert_eq!(decay(&state, now, 60.0), state);
    }

    #[test]
    fn test_concurrency_halves_every_ten_seconds() {
        let now = Utc::now();
        let state = busy_state(now - Duration::seconds(10));
        let decayed = decay(&state, now, 60.0);

        assert_eq!(decayed.concurrent_users, 200);
        // Window has not expired yet.
        assert_eq!(decayed.request_count_window, 500);
        assert_eq!(decayed.spike_ratio, 250.0);

        let state = busy_state(now - Duration::seconds(20));
        assert_eq!(decay(&state, now, 60.0).concurrent_users, 100);
    }

    #[test]
    fn test_concurrency_decay_floors() {
        let now = Utc::now();
        let mut state = busy_state(now - Duration::seconds(10));
        state.concurrent_users = 3;

        assert_eq!(decay(&state, now, 60.0).concurrent_users, 1);
    }

    #[test]
    fn test_window_reset_after_full_window() {
        let now = Utc::now();
        let state = busy_state(now - Duration::seconds(70));
        let decayed = decay(&state, now, 60.0);

        assert_eq!(decayed.request_count_window, 0);
        assert_eq!(decayed.current_traffic, 0.0);
        assert_eq!(decayed.spike_ratio, 0.0);
        assert!(!decayed.is_overloaded);
        assert_eq!(decayed.recovery_progress, 1.0);
        assert_eq!(decayed.baseline_traffic, 12.0);
        assert_eq!(decayed.last_updated, state.last_updated);
    }

    #[test]
    fn test_window_reset_exactly_at_boundary() {
        let now = Utc::now();
        let state = busy_state(now - Duration::seconds(60));

        assert_eq!(decay(&state, now, 60.0).request_count_window, 0);
    }

    #[test]
    fn test_short_window_resets_without_concurrency_decay() {
        let now = Utc::now();
        let state = busy_state(now - Duration::seconds(3));
        let decayed = decay(&state, now, 2.0);

        assert_eq!(decayed.request_count_window, 0);
        assert_eq!(decayed.concurrent_users, 400);
    }

    #[test]
    fn test_clock_skew_counts_as_no_time() {
        let now = Utc::now();
        let state = busy_state(now + Duration::seconds(30));

        assert_eq!(elapsed_seconds(&state, now), 0.0);
        assert_eq!(decay(&state, now, 60.0), state);
    }

    #[test]
    fn test_counters_changed() {
        let now = Utc::now();
        let state = busy_state(now - Duration::seconds(70));
        let decayed = decay(&state, now, 60.0);

        assert!(counters_changed(&state, &decayed));
        assert!(!counters_changed(&state, &state));
    }
}
