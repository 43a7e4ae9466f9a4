//! Processed-payload dedup keys

use chrono::{DateTime, Utc};
use leadflow_common::Result;
use sqlx::SqlitePool;

/// Record a dedup key. Returns `true` when the key is new, `false`
/// when the identical payload was already processed.
pub async fn try_record(pool: &SqlitePool, dedup_key: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO processed_payloads (dedup_key, processed_at) VALUES (?, ?)",
    )
    .bind(dedup_key)
    .bind(now.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
