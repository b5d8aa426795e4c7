//! SQLite storage layer for SurgeGate.
//!
//! Three tables back the admission controller:
//!
//! - `traffic_state`: exactly one row (`id = 1`) holding the aggregate load
//! - `traffic_config`: tuning values keyed by name
//! - `blocked_ips`: one row per blocked address, unique on `ip_address`
//!
//! Timestamps are stored as Unix milliseconds. The two monotonic counters
//! (`request_count_window`, `concurrent_users`) are only ever moved with
//! in-place `UPDATE ... SET x = x + 1` statements; every other state column
//! is a best-effort recompute where the last writer wins.

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::model::{BlockedIp, ConfigKey, TrafficConfig, TrafficState};

/// Primary key of the singleton state row.
const STATE_ROW_ID: i64 = 1;

const STATE_COLUMNS: &str = "baseline_traffic, current_traffic, spike_ratio, \
    request_count_window, concurrent_users, is_overloaded, recovery_progress, last_updated";

const BLOCK_COLUMNS: &str =
    "id, ip_address, reason, request_count, blocked_at, expires_at, is_permanent";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pub(crate) pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance, initialize the schema and seed defaults.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:surgegate.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema(Utc::now()).await?;

        Ok(storage)
    }

    /// Close every pooled connection. Later queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create the tables if they don't exist, then seed the state row and
    /// the default config values without overwriting existing ones.
    async fn initialize_schema(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traffic_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                baseline_traffic REAL NOT NULL,
                current_traffic REAL NOT NULL,
                spike_ratio REAL NOT NULL,
                request_count_window INTEGER NOT NULL,
                concurrent_users INTEGER NOT NULL,
                is_overloaded INTEGER NOT NULL,
                recovery_progress REAL NOT NULL,
                last_updated INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traffic_config (
                key TEXT PRIMARY KEY,
                value REAL NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blocked_ips (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip_address TEXT NOT NULL UNIQUE,
                reason TEXT NOT NULL,
                request_count INTEGER NOT NULL DEFAULT 0,
                blocked_at INTEGER NOT NULL,
                expires_at INTEGER,
                is_permanent INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for the read-time expiry filter
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_blocked_ips_expires_at
            ON blocked_ips(expires_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        let seed = TrafficState::seed(now);
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO traffic_state (id, {STATE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(STATE_ROW_ID)
        .bind(seed.baseline_traffic)
        .bind(seed.current_traffic)
        .bind(seed.spike_ratio)
        .bind(seed.request_count_window)
        .bind(seed.concurrent_users)
        .bind(seed.is_overloaded)
        .bind(seed.recovery_progress)
        .bind(seed.last_updated.timestamp_millis())
        .execute(&self.pool)
        .await?;

        for key in ConfigKey::ALL {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO traffic_config (key, value, description)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(key.as_str())
            .bind(key.default_value())
            .bind(key.description())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Traffic state
    // ------------------------------------------------------------------

    /// Read the singleton state row, or `None` if it was never created.
    pub async fn load_traffic_state(&self) -> anyhow::Result<Option<TrafficState>> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM traffic_state WHERE id = ?"
        ))
        .bind(STATE_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(state_from_row).transpose()
    }

    /// Overwrite the whole state row, creating it if necessary.
    pub async fn save_traffic_state(&self, state: &TrafficState) -> anyhow::Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO traffic_state (id, {STATE_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                baseline_traffic = excluded.baseline_traffic,
                current_traffic = excluded.current_traffic,
                spike_ratio = excluded.spike_ratio,
                request_count_window = excluded.request_count_window,
                concurrent_users = excluded.concurrent_users,
                is_overloaded = excluded.is_overloaded,
                recovery_progress = excluded.recovery_progress,
                last_updated = excluded.last_updated
            "#
        ))
        .bind(STATE_ROW_ID)
        .bind(state.baseline_traffic)
        .bind(state.current_traffic)
        .bind(state.spike_ratio)
        .bind(state.request_count_window)
        .bind(state.concurrent_users)
        .bind(state.is_overloaded)
        .bind(state.recovery_progress)
        .bind(state.last_updated.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist decayed counters, but only if nobody wrote the row since it was read.
    ///
    /// Returns `false` when another writer got there first; its write is at
    /// most a moment old, so the decay it would have undone is negligible.
    pub async fn apply_decay(
        &self,
        read_at: DateTime<Utc>,
        decayed: &TrafficState,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE traffic_state SET
                request_count_window = ?,
                concurrent_users = ?,
                current_traffic = ?,
                spike_ratio = ?,
                is_overloaded = ?,
                recovery_progress = ?,
                last_updated = ?
            WHERE id = ? AND last_updated = ?
            "#,
        )
        .bind(decayed.request_count_window)
        .bind(decayed.concurrent_users)
        .bind(decayed.current_traffic)
        .bind(decayed.spike_ratio)
        .bind(decayed.is_overloaded)
        .bind(decayed.recovery_progress)
        .bind(now.timestamp_millis())
        .bind(STATE_ROW_ID)
        .bind(read_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Atomically count one more request and one more in-flight user.
    ///
    /// Returns the new `(request_count_window, concurrent_users)`, or `None`
    /// if the state row is missing.
    pub async fn increment_counters(&self, now: DateTime<Utc>) -> anyhow::Result<Option<(i64, i64)>> {
        let row = sqlx::query(
            r#"
            UPDATE traffic_state SET
                request_count_window = request_count_window + 1,
                concurrent_users = concurrent_users + 1,
                last_updated = ?
            WHERE id = ?
            RETURNING request_count_window, concurrent_users
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(STATE_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| (r.get("request_count_window"), r.get("concurrent_users"))))
    }

    /// Write the recomputed rate, ratio, baseline and overload fields.
    ///
    /// Counters are deliberately not part of this write.
    pub async fn write_derived(&self, state: &TrafficState) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE traffic_state SET
                current_traffic = ?,
                spike_ratio = ?,
                baseline_traffic = ?,
                is_overloaded = ?,
                recovery_progress = ?,
                last_updated = ?
            WHERE id = ?
            "#,
        )
        .bind(state.current_traffic)
        .bind(state.spike_ratio)
        .bind(state.baseline_traffic)
        .bind(state.is_overloaded)
        .bind(state.recovery_progress)
        .bind(state.last_updated.timestamp_millis())
        .bind(STATE_ROW_ID)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Atomically release one in-flight user, never going below zero.
    ///
    /// `last_updated` is not touched, so a completion does not reset the
    /// decay clock. Returns the new count, or `None` if the row is missing.
    pub async fn decrement_concurrent(&self) -> anyhow::Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            UPDATE traffic_state SET
                concurrent_users = MAX(concurrent_users - 1, 0)
            WHERE id = ?
            RETURNING concurrent_users
            "#,
        )
        .bind(STATE_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("concurrent_users")))
    }

    // ------------------------------------------------------------------
    // Traffic config
    // ------------------------------------------------------------------

    /// Read the config table merged over defaults.
    pub async fn load_config(&self) -> anyhow::Result<TrafficConfig> {
        let rows = sqlx::query("SELECT key, value FROM traffic_config")
            .fetch_all(&self.pool)
            .await?;

        let pairs: Vec<(String, f64)> = rows
            .iter()
            .map(|r| -> Result<(String, f64), sqlx::Error> {
                Ok((r.try_get("key")?, r.try_get("value")?))
            })
            .collect::<Result<_, _>>()?;

        Ok(TrafficConfig::from_overrides(
            pairs.iter().map(|(k, v)| (k.as_str(), *v)),
        ))
    }

    /// Set one or more config values in a single transaction.
    pub async fn update_config(&self, updates: &[(ConfigKey, f64)]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        for (key, value) in updates {
            sqlx::query(
                r#"
                INSERT INTO traffic_config (key, value, description)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(key.as_str())
            .bind(*value)
            .bind(key.description())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blocklist
    // ------------------------------------------------------------------

    /// Insert or refresh the block for `ip_address`.
    ///
    /// `permanent = None` keeps the permanence of an existing block (and
    /// means "not permanent" for a new one). Non-permanent blocks expire
    /// `ttl` after `now`; permanent ones have no expiry.
    pub async fn upsert_block(
        &self,
        ip_address: &str,
        reason: &str,
        permanent: Option<bool>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<BlockedIp> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<bool> =
            sqlx::query_scalar("SELECT is_permanent FROM blocked_ips WHERE ip_address = ?")
                .bind(ip_address)
                .fetch_optional(&mut *tx)
                .await?;

        let is_permanent = permanent.or(existing).unwrap_or(false);
        let expires_at = (!is_permanent).then(|| (now + ttl).timestamp_millis());

        sqlx::query(
            r#"
            INSERT INTO blocked_ips (ip_address, reason, request_count, blocked_at, expires_at, is_permanent)
            VALUES (?, ?, 0, ?, ?, ?)
            ON CONFLICT(ip_address) DO UPDATE SET
                reason = excluded.reason,
                blocked_at = excluded.blocked_at,
                expires_at = excluded.expires_at,
                is_permanent = excluded.is_permanent
            "#,
        )
        .bind(ip_address)
        .bind(reason)
        .bind(now.timestamp_millis())
        .bind(expires_at)
        .bind(is_permanent)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocked_ips WHERE ip_address = ?"
        ))
        .bind(ip_address)
        .fetch_one(&mut *tx)
        .await?;
        let blocked = block_from_row(&row)?;

        tx.commit().await?;
        Ok(blocked)
    }

    /// Delete a block by primary key. Returns the number of rows removed.
    pub async fn delete_block_by_id(&self, id: i64) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM blocked_ips WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete a block by address. Returns the number of rows removed.
    pub async fn delete_block_by_ip(&self, ip_address: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM blocked_ips WHERE ip_address = ?")
            .bind(ip_address)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// All blocks active at `now`, newest first. Expired rows stay in the table.
    pub async fn list_active_blocks(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<BlockedIp>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {BLOCK_COLUMNS}
            FROM blocked_ips
            WHERE is_permanent = 1 OR expires_at IS NULL OR expires_at > ?
            ORDER BY blocked_at DESC, id DESC
            "#
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(block_from_row).collect()
    }

    /// The active block for `ip_address`, if any.
    pub async fn find_active_block(
        &self,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<BlockedIp>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {BLOCK_COLUMNS}
            FROM blocked_ips
            WHERE ip_address = ?
              AND (is_permanent = 1 OR expires_at IS NULL OR expires_at > ?)
            "#
        ))
        .bind(ip_address)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(block_from_row).transpose()
    }

    /// Count one more rejected request from a blocked address.
    pub async fn record_block_hit(&self, ip_address: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE blocked_ips SET request_count = request_count + 1 WHERE ip_address = ?")
            .bind(ip_address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn timestamp_from_millis(millis: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| anyhow::anyhow!("invalid stored timestamp: {millis}"))
}

fn state_from_row(row: &SqliteRow) -> anyhow::Result<TrafficState> {
    Ok(TrafficState {
        baseline_traffic: row.try_get("baseline_traffic")?,
        current_traffic: row.try_get("current_traffic")?,
        spike_ratio: row.try_get("spike_ratio")?,
        request_count_window: row.try_get("request_count_window")?,
        concurrent_users: row.try_get("concurrent_users")?,
        is_overloaded: row.try_get("is_overloaded")?,
        recovery_progress: row.try_get("recovery_progress")?,
        last_updated: timestamp_from_millis(row.try_get("last_updated")?)?,
    })
}

fn block_from_row(row: &SqliteRow) -> anyhow::Result<BlockedIp> {
    let expires_at: Option<i64> = row.try_get("expires_at")?;

    Ok(BlockedIp {
        id: row.try_get("id")?,
        ip_address: row.try_get("ip_address")?,
        reason: row.try_get("reason")?,
        request_count: row.try_get("request_count")?,
        blocked_at: timestamp_from_millis(row.try_get("blocked_at")?)?,
        expires_at: expires_at.map(timestamp_from_millis).transpose()?,
        is_permanent: row.try_get("is_permanent")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_seeds_state_and_config() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let state = storage.load_traffic_state().await.unwrap().unwrap();
        assert_eq!(state.baseline_traffic, 10.0);
        assert_eq!(state.request_count_window, 0);
        assert_eq!(state.concurrent_users, 0);
        assert!(!state.is_overloaded);

        let config = storage.load_config().await.unwrap();
        assert_eq!(config, TrafficConfig::default());
    }

    #[tokio::test]
    async fn test_reinitializing_keeps_existing_rows() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage
            .update_config(&[(ConfigKey::WindowSeconds, 30.0)])
            .await
            .unwrap();
        storage.increment_counters(Utc::now()).await.unwrap();

        storage.initialize_schema(Utc::now()).await.unwrap();

        let config = storage.load_config().await.unwrap();
        assert_eq!(config.window_seconds, 30.0);
        let state = storage.load_traffic_state().await.unwrap().unwrap();
        assert_eq!(state.request_count_window, 1);
    }

    #[tokio::test]
    async fn test_save_and_load_state() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        let state = TrafficState {
            baseline_traffic: 4.5,
            current_traffic: 2.0,
            spike_ratio: 44.4,
            request_count_window: 120,
            concurrent_users: 17,
            is_overloaded: false,
            recovery_progress: 1.0,
            last_updated: now,
        };
        storage.save_traffic_state(&state).await.unwrap();

        let loaded = storage.load_traffic_state().await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_increment_and_decrement_counters() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        for _ in 0..3 {
            storage.increment_counters(now).await.unwrap();
        }
        let counters = storage.increment_counters(now).await.unwrap();
        assert_eq!(counters, Some((4, 4)));

        for _ in 0..10 {
            storage.decrement_concurrent().await.unwrap();
        }
        let state = storage.load_traffic_state().await.unwrap().unwrap();
        assert_eq!(state.concurrent_users, 0);
        assert_eq!(state.request_count_window, 4);
    }

    #[tokio::test]
    async fn test_apply_decay_only_when_row_unchanged() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let stored = storage.load_traffic_state().await.unwrap().unwrap();
        let now = stored.last_updated + Duration::seconds(90);

        let mut decayed = stored.clone();
        decayed.concurrent_users = 0;
        assert!(storage.apply_decay(stored.last_updated, &decayed, now).await.unwrap());

        // The row now carries `now`, so a second writer holding the old snapshot loses.
        assert!(!storage.apply_decay(stored.last_updated, &decayed, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_state_row() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        sqlx::query("DELETE FROM traffic_state")
            .execute(&storage.pool)
            .await
            .unwrap();

        assert!(storage.load_traffic_state().await.unwrap().is_none());
        assert!(storage.increment_counters(Utc::now()).await.unwrap().is_none());
        assert!(storage.decrement_concurrent().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_block_upsert_keeps_single_row() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        let first = storage
            .upsert_block("1.2.3.4", "abuse", Some(true), Duration::hours(24), now)
            .await
            .unwrap();
        assert!(first.is_permanent);
        assert!(first.expires_at.is_none());

        let second = storage
            .upsert_block("1.2.3.4", "scraping", None, Duration::hours(24), now)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.reason, "scraping");
        assert!(second.is_permanent);

        let active = storage.list_active_blocks(now).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_blocks_are_filtered() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        storage
            .upsert_block("10.0.0.1", "old", Some(false), Duration::hours(1), now - Duration::hours(2))
            .await
            .unwrap();
        storage
            .upsert_block("10.0.0.2", "fresh", Some(false), Duration::hours(1), now)
            .await
            .unwrap();

        let active = storage.list_active_blocks(now).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].ip_address, "10.0.0.2");

        assert!(storage.find_active_block("10.0.0.1", now).await.unwrap().is_none());
        assert!(storage.find_active_block("10.0.0.2", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_block_is_idempotent() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        let block = storage
            .upsert_block("10.0.0.9", "test", None, Duration::hours(24), now)
            .await
            .unwrap();

        assert_eq!(storage.delete_block_by_id(block.id).await.unwrap(), 1);
        assert_eq!(storage.delete_block_by_id(block.id).await.unwrap(), 0);
        assert_eq!(storage.delete_block_by_ip("10.0.0.9").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_block_hit() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        storage
            .upsert_block("10.0.0.3", "test", None, Duration::hours(24), now)
            .await
            .unwrap();
        storage.record_block_hit("10.0.0.3").await.unwrap();
        storage.record_block_hit("10.0.0.3").await.unwrap();

        let block = storage.find_active_block("10.0.0.3", now).await.unwrap().unwrap();
        assert_eq!(block.request_count, 2);
    }
}
