//! Per-address deny list.
//!
//! Orthogonal to the spike and concurrency math: a blocked address is
//! rejected before the admission controller runs. Blocks are upserted by
//! address, removed explicitly, and expire lazily (filtered at read time,
//! never purged in the background).

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::AdminError;
use crate::model::{BlockRequest, BlockedIp, UnblockQuery};
use crate::storage::Storage;

/// Lifetime of a non-permanent block when none is given.
pub const DEFAULT_BLOCK_TTL_HOURS: f64 = 24.0;

/// Longest accepted block lifetime (ten years). Use a permanent block beyond that.
pub const MAX_BLOCK_TTL_HOURS: f64 = 24.0 * 365.0 * 10.0;

const DEFAULT_BLOCK_REASON: &str = "Manually blocked by admin";

const MAX_ADDRESS_LEN: usize = 128;

/// Which block to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnblockTarget {
    Id(i64),
    Ip(String),
}

impl UnblockTarget {
    /// Pick the target from query parameters; the id wins when both are given.
    pub fn from_query(query: &UnblockQuery) -> Result<Self, AdminError> {
        if let Some(id) = query.id {
            return Ok(UnblockTarget::Id(id));
        }
        match query.ip.as_deref().map(str::trim) {
            Some(ip) if !ip.is_empty() => Ok(UnblockTarget::Ip(ip.to_string())),
            _ => Err(AdminError::validation("ip or id is required")),
        }
    }
}

#[derive(Clone)]
pub struct Blocklist {
    storage: Storage,
}

impl Blocklist {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Block an address, or refresh the reason and expiry of an existing block.
    pub async fn block(
        &self,
        request: &BlockRequest,
        now: DateTime<Utc>,
    ) -> Result<BlockedIp, AdminError> {
        let ip_address = request.ip_address.trim();
        if ip_address.is_empty() {
            return Err(AdminError::validation("ip_address is required"));
        }
        if ip_address.len() > MAX_ADDRESS_LEN {
            return Err(AdminError::validation("ip_address is too long"));
        }

        let ttl = block_ttl(request.expires_hours)?;
        let reason = request
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_BLOCK_REASON);

        let blocked = self
            .storage
            .upsert_block(ip_address, reason, request.is_permanent, ttl, now)
            .await?;

        info!(
            ip = %blocked.ip_address,
            permanent = blocked.is_permanent,
            expires_at = ?blocked.expires_at,
            "Address blocked"
        );
        Ok(blocked)
    }

    /// Remove a block. Removing something that is not there is not an error.
    pub async fn unblock(&self, target: &UnblockTarget) -> Result<u64, AdminError> {
        let removed = match target {
            UnblockTarget::Id(id) => self.storage.delete_block_by_id(*id).await?,
            UnblockTarget::Ip(ip) => self.storage.delete_block_by_ip(ip).await?,
        };

        info!(target = ?target, removed, "Address unblocked");
        Ok(removed)
    }

    /// Every block active at `now`.
    pub async fn list_active(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<BlockedIp>> {
        self.storage.list_active_blocks(now).await
    }

    /// The active block for `ip_address`, if there is one.
    pub async fn is_blocked(
        &self,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<BlockedIp>> {
        self.storage.find_active_block(ip_address, now).await
    }

    /// Bump the informational hit counter of a blocked address.
    pub async fn record_hit(&self, ip_address: &str) -> anyhow::Result<()> {
        self.storage.record_block_hit(ip_address).await
    }
}

fn block_ttl(expires_hours: Option<f64>) -> Result<Duration, AdminError> {
    let hours = expires_hours.unwrap_or(DEFAULT_BLOCK_TTL_HOURS);
    if !hours.is_finite() || hours <= 0.0 {
        return Err(AdminError::validation("expires_hours must be a positive number"));
    }
    if hours > MAX_BLOCK_TTL_HOURS {
        return Err(AdminError::validation(
            "expires_hours is too large; use is_permanent instead",
        ));
    }
    Ok(Duration::milliseconds((hours * 3_600_000.0).round() as i64))
}
