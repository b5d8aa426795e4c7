//! Admission controller.
//!
//! Orchestrates read → decay → (increment) → decide for every inbound
//! request. The controller holds no in-process traffic state: the single
//! source of truth is the persisted state row, so any number of instances
//! can share one store.
//!
//! # Failure semantics
//!
//! The admission path fails open. A missing row, an unreachable store or any
//! other error admits the request with a diagnostic reason instead of
//! turning an infrastructure fault into an outage.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::aggregation::record_counts;
use crate::blocklist::Blocklist;
use crate::decay::{counters_changed, decay};
use crate::model::{
    AdmissionOutcome, ConfigKey, Decision, FailOpenReason, RejectReason, TrafficConfig,
    TrafficState,
};
use crate::policy::decide;
use crate::storage::Storage;

/// Whether an admission check also counts the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Decide on the current (decayed) state only.
    Check,
    /// Count the request first, then decide on the updated state.
    CheckAndIncrement,
}

#[derive(Clone)]
pub struct AdmissionController {
    storage: Storage,
    blocklist: Blocklist,
}

impl AdmissionController {
    pub fn new(storage: Storage) -> Self {
        Self {
            blocklist: Blocklist::new(storage.clone()),
            storage,
        }
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    /// Full admission check for one client: blocklist first, then load.
    ///
    /// A blocklist lookup failure is ignored (fail open) and the load check
    /// still runs.
    pub async fn check_client(
        &self,
        client_ip: Option<&str>,
        mode: CheckMode,
        now: DateTime<Utc>,
    ) -> AdmissionOutcome {
        if let Some(ip) = client_ip.map(str::trim).filter(|ip| !ip.is_empty()) {
            match self.blocklist.is_blocked(ip, now).await {
                Ok(Some(block)) => {
                    info!(ip = %block.ip_address, reason = %block.reason, "Rejected blocked address");
                    return AdmissionOutcome {
                        decision: Decision::Reject(RejectReason::Blocked),
                        fail_open: None,
                        state: self.read(now).await,
                    };
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Blocklist lookup failed; skipping it"),
            }
        }

        match mode {
            CheckMode::Check => self.check(now).await,
            CheckMode::CheckAndIncrement => self.check_and_increment(now).await,
        }
    }

    /// Decide on the decayed state without counting the request.
    pub async fn check(&self, now: DateTime<Utc>) -> AdmissionOutcome {
        let (stored, config) = match self.load(now).await {
            Ok(loaded) => loaded,
            Err(outcome) => return outcome,
        };

        let state = decay(&stored, now, config.window_seconds);
        let outcome = decided(state, &config);
        log_outcome(&outcome);
        outcome
    }

    /// Count the request, then decide on the updated state.
    pub async fn check_and_increment(&self, now: DateTime<Utc>) -> AdmissionOutcome {
        let (stored, config) = match self.load(now).await {
            Ok(loaded) => loaded,
            Err(outcome) => return outcome,
        };

        let outcome = match self.record_request(&stored, &config, now).await {
            Ok(Some(state)) => decided(state, &config),
            Ok(None) => {
                warn!("Traffic state row vanished during increment; admitting");
                fail_open(FailOpenReason::NoState, now)
            }
            Err(e) => {
                warn!(error = %e, "Traffic increment failed; admitting");
                fail_open(FailOpenReason::Error, now)
            }
        };
        log_outcome(&outcome);
        outcome
    }

    /// Count one admitted request. Used fire-and-forget after an admit.
    ///
    /// Returns the updated state, or `None` if the state row is missing.
    pub async fn increment(&self, now: DateTime<Utc>) -> anyhow::Result<Option<TrafficState>> {
        let Some(stored) = self.storage.load_traffic_state().await? else {
            return Ok(None);
        };
        let config = self.config().await;
        self.record_request(&stored, &config, now).await
    }

    /// Release one in-flight request. Never drops below zero.
    pub async fn decrement(&self) -> anyhow::Result<()> {
        match self.storage.decrement_concurrent().await? {
            Some(concurrent_users) => debug!(concurrent_users, "Request completed"),
            None => warn!("Traffic state row missing; completion not recorded"),
        }
        Ok(())
    }

    /// The state as of `now`, for dashboards. Nothing is written.
    pub async fn read(&self, now: DateTime<Utc>) -> TrafficState {
        match self.load(now).await {
            Ok((stored, config)) => decay(&stored, now, config.window_seconds),
            Err(outcome) => outcome.state,
        }
    }

    /// Replace the state row with the seed state.
    pub async fn reset(&self, now: DateTime<Utc>) -> anyhow::Result<TrafficState> {
        let state = TrafficState::seed(now);
        self.storage.save_traffic_state(&state).await?;
        info!("Traffic state reset");
        Ok(state)
    }

    /// Effective config; the defaults when the table cannot be read.
    pub async fn config(&self) -> TrafficConfig {
        match self.storage.load_config().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Traffic config unavailable; using defaults");
                TrafficConfig::default()
            }
        }
    }

    /// Store new values for the given keys and return the effective config.
    pub async fn update_config(
        &self,
        updates: &[(ConfigKey, f64)],
    ) -> anyhow::Result<TrafficConfig> {
        self.storage.update_config(updates).await?;
        let config = self.storage.load_config().await?;
        info!(keys = ?updates.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(), "Traffic config updated");
        Ok(config)
    }

    /// Read state and config, or the fail-open outcome to return instead.
    async fn load(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(TrafficState, TrafficConfig), AdmissionOutcome> {
        let stored = match self.storage.load_traffic_state().await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!("Traffic state row missing; admitting");
                return Err(fail_open(FailOpenReason::NoState, now));
            }
            Err(e) => {
                warn!(error = %e, "Traffic state unavailable; admitting");
                return Err(fail_open(FailOpenReason::DbUnavailable, now));
            }
        };

        Ok((stored, self.config().await))
    }

    /// Decay, count and recompute.
    ///
    /// The counters move with atomic increments; the decayed values are
    /// written first, guarded on the row being unchanged since it was read.
    async fn record_request(
        &self,
        stored: &TrafficState,
        config: &TrafficConfig,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<TrafficState>> {
        let decayed = decay(stored, now, config.window_seconds);

        if counters_changed(stored, &decayed)
            && !self
                .storage
                .apply_decay(stored.last_updated, &decayed, now)
                .await?
        {
            debug!("Decay already applied by a concurrent writer");
        }

        let Some((request_count_window, concurrent_users)) =
            self.storage.increment_counters(now).await?
        else {
            return Ok(None);
        };

        let next = record_counts(&decayed, request_count_window, concurrent_users, config, now);
        self.storage.write_derived(&next).await?;

        Ok(Some(next))
    }
}

fn decided(state: TrafficState, config: &TrafficConfig) -> AdmissionOutcome {
    AdmissionOutcome {
        decision: decide(&state, config),
        fail_open: None,
        state,
    }
}

fn fail_open(reason: FailOpenReason, now: DateTime<Utc>) -> AdmissionOutcome {
    AdmissionOutcome {
        decision: Decision::Allow,
        fail_open: Some(reason),
        state: TrafficState::seed(now),
    }
}

fn log_outcome(outcome: &AdmissionOutcome) {
    let state = &outcome.state;
    match outcome.decision {
        Decision::Reject(reason) => info!(
            reason = reason.as_str(),
            spike_ratio = state.spike_ratio,
            concurrent_users = state.concurrent_users,
            "Request rejected"
        ),
        Decision::AllowWithWarning(warning) => info!(
            warning = warning.as_str(),
            spike_ratio = state.spike_ratio,
            "Traffic spike detected"
        ),
        Decision::Allow => debug!(
            spike_ratio = state.spike_ratio,
            concurrent_users = state.concurrent_users,
            "Request admitted"
        ),
    }
}
