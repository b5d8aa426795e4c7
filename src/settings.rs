//! Process settings read from `SURGEGATE_*` environment variables.
//!
//! Unparseable values fall back to their default with a warning rather than
//! aborting startup.

use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use tracing::warn;

use crate::auth::DEV_ADMIN_TOKEN;
use crate::interceptor::EdgeSettings;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_URL: &str = "sqlite:surgegate.db?mode=rwc";

const DEFAULT_DECISION_CACHE_MS: u64 = 1000;
const DEFAULT_CHECK_TIMEOUT_MS: u64 = 500;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub database_url: String,
    pub admin_token: String,
    /// Origin that admitted page requests are relayed to, if any.
    pub upstream_url: Option<String>,
    pub upstream_timeout: Duration,
    pub edge: EdgeSettings,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let decision_cache_ms = parsed(&lookup, "SURGEGATE_DECISION_CACHE_MS", DEFAULT_DECISION_CACHE_MS);
        let check_timeout_ms = parsed(&lookup, "SURGEGATE_CHECK_TIMEOUT_MS", DEFAULT_CHECK_TIMEOUT_MS);

        Self {
            port: parsed(&lookup, "SURGEGATE_PORT", DEFAULT_PORT),
            database_url: text("SURGEGATE_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DB_URL.to_string()),
            admin_token: text("SURGEGATE_ADMIN_TOKEN")
                .unwrap_or_else(|| DEV_ADMIN_TOKEN.to_string()),
            upstream_url: text("SURGEGATE_UPSTREAM_URL"),
            upstream_timeout: Duration::from_secs(parsed(
                &lookup,
                "SURGEGATE_UPSTREAM_TIMEOUT_SECS",
                DEFAULT_UPSTREAM_TIMEOUT_SECS,
            )),
            edge: EdgeSettings {
                decision_cache_ttl: Duration::from_millis(decision_cache_ms),
                check_timeout: Duration::from_millis(check_timeout_ms),
                trusted_proxies: lookup("SURGEGATE_TRUSTED_PROXIES")
                    .map(|raw| trusted_proxies(&raw))
                    .unwrap_or_default(),
            },
        }
    }

    pub fn uses_dev_admin_token(&self) -> bool {
        self.admin_token == DEV_ADMIN_TOKEN
    }
}

/// Comma-separated CIDR ranges or bare addresses. Bad entries are skipped.
fn trusted_proxies(raw: &str) -> Vec<IpNet> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let parsed = entry
                .parse::<IpNet>()
                .ok()
                .or_else(|| entry.parse::<IpAddr>().ok().map(IpNet::from));
            if parsed.is_none() {
                warn!(entry, "Ignoring unparseable trusted proxy");
            }
            parsed
        })
        .collect()
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = %default, "Ignoring unparseable setting");
            default
        }),
    }
}
