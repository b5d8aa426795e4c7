//! Data models for SurgeGate.
//!
//! Three persisted shapes live here: the singleton [`TrafficState`] row, the
//! [`TrafficConfig`] tuning table (strongly typed, merged over defaults) and
//! the per-address [`BlockedIp`] rows. The admission vocabulary
//! ([`Decision`], [`RejectReason`], ...) and the HTTP request/response bodies
//! are defined alongside them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Baseline request rate a fresh deployment starts from (requests/second).
pub const DEFAULT_BASELINE_TRAFFIC: f64 = 10.0;

/// Once initialized, the baseline never collapses below this rate.
pub const BASELINE_FLOOR: f64 = 0.1;

/// The single mutable record of aggregate load.
///
/// One logical row exists per deployment. It is created at setup time and
/// mutated in place by every admitted request; it is never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficState {
    /// Exponential moving average of the observed request rate (req/s).
    pub baseline_traffic: f64,

    /// Request rate computed from the current counting window (req/s).
    pub current_traffic: f64,

    /// `current_traffic / baseline_traffic * 100`; 100 means nominal load.
    pub spike_ratio: f64,

    /// Raw request count accumulated since the window last reset.
    pub request_count_window: i64,

    /// Approximate number of in-flight admitted requests.
    pub concurrent_users: i64,

    /// Set while `spike_ratio` is at or above the hard-overload threshold.
    pub is_overloaded: bool,

    /// 0 while overloaded, 1 once recovered.
    pub recovery_progress: f64,

    /// Wall-clock time of the last write; the anchor for decay.
    pub last_updated: DateTime<Utc>,
}

impl TrafficState {
    /// The state a deployment starts with.
    pub fn seed(now: DateTime<Utc>) -> Self {
        Self {
            baseline_traffic: DEFAULT_BASELINE_TRAFFIC,
            current_traffic: 0.0,
            spike_ratio: 0.0,
            request_count_window: 0,
            concurrent_users: 0,
            is_overloaded: false,
            recovery_progress: 1.0,
            last_updated: now,
        }
    }
}

/// Keys of the traffic tuning table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    SpikeTriggerPercentage,
    HardOverloadPercentage,
    MaxConcurrentUsers,
    RecoveryRate,
    BaselineAlpha,
    WindowSeconds,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 6] = [
        ConfigKey::SpikeTriggerPercentage,
        ConfigKey::HardOverloadPercentage,
        ConfigKey::MaxConcurrentUsers,
        ConfigKey::RecoveryRate,
        ConfigKey::BaselineAlpha,
        ConfigKey::WindowSeconds,
    ];

    /// Column value used in the `traffic_config` table.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::SpikeTriggerPercentage => "spike_trigger_percentage",
            ConfigKey::HardOverloadPercentage => "hard_overload_percentage",
            ConfigKey::MaxConcurrentUsers => "max_concurrent_users",
            ConfigKey::RecoveryRate => "recovery_rate",
            ConfigKey::BaselineAlpha => "baseline_alpha",
            ConfigKey::WindowSeconds => "window_seconds",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }

    pub fn default_value(&self) -> f64 {
        match self {
            ConfigKey::SpikeTriggerPercentage => 120.0,
            ConfigKey::HardOverloadPercentage => 200.0,
            ConfigKey::MaxConcurrentUsers => 1000.0,
            ConfigKey::RecoveryRate => 0.1,
            ConfigKey::BaselineAlpha => 0.1,
            ConfigKey::WindowSeconds => 60.0,
        }
    }

    /// Human-readable description stored next to the seeded value.
    pub fn description(&self) -> &'static str {
        match self {
            ConfigKey::SpikeTriggerPercentage => "Spike ratio (%) above which requests are flagged",
            ConfigKey::HardOverloadPercentage => "Spike ratio (%) above which requests are rejected",
            ConfigKey::MaxConcurrentUsers => "Hard cap on concurrent in-flight requests",
            ConfigKey::RecoveryRate => "Reserved recovery pacing knob",
            ConfigKey::BaselineAlpha => "Smoothing factor of the baseline moving average",
            ConfigKey::WindowSeconds => "Length of the request counting window in seconds",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunable admission thresholds.
///
/// Built from the sparse rows of the config table: any key that is absent,
/// non-finite or not strictly positive keeps its default, so a malformed
/// table can never make the controller reject traffic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficConfig {
    pub spike_trigger_percentage: f64,
    pub hard_overload_percentage: f64,
    pub max_concurrent_users: f64,
    pub recovery_rate: f64,
    pub baseline_alpha: f64,
    pub window_seconds: f64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            spike_trigger_percentage: ConfigKey::SpikeTriggerPercentage.default_value(),
            hard_overload_percentage: ConfigKey::HardOverloadPercentage.default_value(),
            max_concurrent_users: ConfigKey::MaxConcurrentUsers.default_value(),
            recovery_rate: ConfigKey::RecoveryRate.default_value(),
            baseline_alpha: ConfigKey::BaselineAlpha.default_value(),
            window_seconds: ConfigKey::WindowSeconds.default_value(),
        }
    }
}

impl TrafficConfig {
    /// Merge stored `(key, value)` rows over the defaults.
    ///
    /// Unknown keys are ignored.
    pub fn from_overrides<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut config = Self::default();
        for (key, value) in rows {
            if let Some(key) = ConfigKey::parse(key) {
                config.set(key, value);
            }
        }
        config
    }

    pub fn get(&self, key: ConfigKey) -> f64 {
        match key {
            ConfigKey::SpikeTriggerPercentage => self.spike_trigger_percentage,
            ConfigKey::HardOverloadPercentage => self.hard_overload_percentage,
            ConfigKey::MaxConcurrentUsers => self.max_concurrent_users,
            ConfigKey::RecoveryRate => self.recovery_rate,
            ConfigKey::BaselineAlpha => self.baseline_alpha,
            ConfigKey::WindowSeconds => self.window_seconds,
        }
    }

    /// Apply one value, falling back to the key's default when it is unusable.
    fn set(&mut self, key: ConfigKey, value: f64) {
        let value = if value.is_finite() && value > 0.0 {
            value
        } else {
            key.default_value()
        };

        match key {
            ConfigKey::SpikeTriggerPercentage => self.spike_trigger_percentage = value,
            ConfigKey::HardOverloadPercentage => self.hard_overload_percentage = value,
            ConfigKey::MaxConcurrentUsers => self.max_concurrent_users = value,
            ConfigKey::RecoveryRate => self.recovery_rate = value,
            ConfigKey::BaselineAlpha => self.baseline_alpha = value.min(1.0),
            ConfigKey::WindowSeconds => self.window_seconds = value,
        }
    }
}

/// One blocked client address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedIp {
    pub id: i64,
    pub ip_address: String,
    pub reason: String,

    /// Rejected requests seen from this address while blocked. Informational.
    pub request_count: i64,

    pub blocked_at: DateTime<Utc>,

    /// `None` means the block never expires.
    pub expires_at: Option<DateTime<Utc>>,

    pub is_permanent: bool,
}

impl BlockedIp {
    /// A block is active iff it is permanent, has no expiry, or expires later than `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_permanent {
            return true;
        }
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at > now,
        }
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Spike ratio reached the hard-overload threshold.
    HardOverload,
    /// Concurrent in-flight requests reached the cap.
    MaxConcurrent,
    /// The client address is on the blocklist.
    Blocked,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::HardOverload => "hard_overload",
            RejectReason::MaxConcurrent => "max_concurrent",
            RejectReason::Blocked => "blocked",
        }
    }
}

/// Why an admitted request was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningReason {
    SpikeDetected,
}

impl WarningReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningReason::SpikeDetected => "spike_detected",
        }
    }
}

/// Why a check admitted traffic without consulting the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailOpenReason {
    /// The store could not be read.
    DbUnavailable,
    /// The singleton state row does not exist.
    NoState,
    /// Anything else went wrong mid-check.
    Error,
}

impl FailOpenReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailOpenReason::DbUnavailable => "db_unavailable",
            FailOpenReason::NoState => "no_state",
            FailOpenReason::Error => "error",
        }
    }
}

/// Result of the admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    AllowWithWarning(WarningReason),
    Reject(RejectReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Reject(_))
    }
}

/// What the controller hands back for one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionOutcome {
    pub decision: Decision,

    /// Set when the check failed open instead of running the policy.
    pub fail_open: Option<FailOpenReason>,

    /// Snapshot the decision was made on.
    pub state: TrafficState,
}

/// Response body of an admission check.
///
/// `reason` names the reject reason when `allowed` is false, or the
/// fail-open diagnostic when the check could not run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,

    pub state: TrafficState,
}

impl From<AdmissionOutcome> for CheckResponse {
    fn from(outcome: AdmissionOutcome) -> Self {
        let (reason, warning) = match outcome.decision {
            Decision::Reject(reason) => (Some(reason.as_str().to_string()), None),
            Decision::AllowWithWarning(warning) => (None, Some(warning.as_str().to_string())),
            Decision::Allow => (None, None),
        };
        let reason = reason.or_else(|| outcome.fail_open.map(|r| r.as_str().to_string()));

        Self {
            allowed: outcome.decision.is_allowed(),
            reason,
            warning,
            state: outcome.state,
        }
    }
}

/// Request body for POST /api/traffic/state.
#[derive(Debug, Clone, Deserialize)]
pub struct StateRequest {
    /// One of `check`, `check_and_increment`, `increment`, `decrement`.
    pub action: String,

    /// Client address to run through the blocklist before the check.
    #[serde(default)]
    pub client_ip: Option<String>,
}

/// Response for GET /api/traffic/config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub config: TrafficConfig,
}

/// Request body for POST /api/traffic/blocked-ips.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockRequest {
    #[serde(default)]
    pub ip_address: String,

    #[serde(default)]
    pub reason: Option<String>,

    /// `None` keeps the current permanence of an existing block (new blocks default to false).
    #[serde(default)]
    pub is_permanent: Option<bool>,

    /// Lifetime of a non-permanent block (default: 24).
    #[serde(default)]
    pub expires_hours: Option<f64>,
}

/// Query parameters for DELETE /api/traffic/blocked-ips.
#[derive(Debug, Clone, Deserialize)]
pub struct UnblockQuery {
    pub ip: Option<String>,
    pub id: Option<i64>,
}

/// Response for GET /api/traffic/blocked-ips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedIpsResponse {
    pub blocked_ips: Vec<BlockedIp>,
}
