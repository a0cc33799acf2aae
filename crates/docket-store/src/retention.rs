//! Retention re-tiering and cold expiry.
//!
//! Tiers are pinned at save time and recomputed here on rollover. Logs are
//! never deleted through the API; the only deletion path is tier-based
//! expiry of cold rows past the configured bound.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use docket_types::{RetentionBounds, RetentionTier};

use crate::error::StoreError;

/// Rows moved per expiry batch. Expiry loops until a batch comes up short.
pub const EXPIRY_BATCH: usize = 5_000;

/// Recomputes retention tiers for rows whose age has crossed a boundary.
///
/// Returns the number of rows whose tier changed.
pub fn retier_logs(
    conn: &Connection,
    now: DateTime<Utc>,
    bounds: &RetentionBounds,
) -> Result<usize, StoreError> {
    let hot_floor_ms = (now - Duration::days(bounds.hot_days)).timestamp_millis();
    let warm_floor_ms = (now - Duration::days(bounds.warm_days)).timestamp_millis();

    // Oldest first so a row crossing two boundaries in one pass settles cold.
    let to_warm = conn.execute(
        "UPDATE decision_logs SET retention_tier = ?1
         WHERE retention_tier = ?2 AND timestamp_ms <= ?3 AND timestamp_ms > ?4",
        params![
            RetentionTier::Warm.as_str(),
            RetentionTier::Hot.as_str(),
            hot_floor_ms,
            warm_floor_ms,
        ],
    )?;

    let to_cold = conn.execute(
        "UPDATE decision_logs SET retention_tier = ?1
         WHERE retention_tier != ?1 AND timestamp_ms <= ?2",
        params![RetentionTier::Cold.as_str(), warm_floor_ms],
    )?;

    Ok(to_warm + to_cold)
}

/// Deletes one batch of cold rows older than the expiry cutoff.
///
/// Returns the number of rows deleted; callers loop while the batch is full.
pub fn expire_cold_batch(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let deleted = conn.execute(
        "DELETE FROM decision_logs
         WHERE id IN (
            SELECT id FROM decision_logs
            WHERE retention_tier = ?1 AND timestamp_ms < ?2
            ORDER BY timestamp_ms ASC
            LIMIT ?3
         )",
        params![
            RetentionTier::Cold.as_str(),
            cutoff.timestamp_millis(),
            EXPIRY_BATCH as i64,
        ],
    )?;
    Ok(deleted)
}
