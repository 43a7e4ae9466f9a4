//! Deferred-reconciliation queue
//!
//! Units of work whose CRM sync could not complete inline are parked
//! here and replayed by the reconciler sweep. Entries end in one of
//! three terminal states: `done` (replayed successfully), `superseded`
//! (a newer touchpoint landed first; the stale write was abandoned),
//! or `dead` (attempt cap reached or payload unusable).

use chrono::{DateTime, Utc};
use leadflow_common::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

/// Queue entry statuses
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_DONE: &str = "done";
pub const STATUS_SUPERSEDED: &str = "superseded";
pub const STATUS_DEAD: &str = "dead";

/// One queued unit of work
#[derive(Debug, Clone)]
pub struct DeferredRow {
    pub id: String,
    pub identity_key: String,
    /// Serialized `MergeRequest`
    pub payload: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Park a unit of work for deferred replay, due immediately
pub async fn enqueue(
    pool: &SqlitePool,
    identity_key: &str,
    payload: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO deferred_sync (id, identity_key, payload, attempts, next_attempt_at, last_error, status, created_at)
        VALUES (?, ?, ?, 0, ?, ?, 'pending', ?)
        "#,
    )
    .bind(&id)
    .bind(identity_key)
    .bind(payload)
    .bind(now.to_rfc3339())
    .bind(reason)
    .bind(now.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(id)
}

/// Fetch pending entries whose retry time has come
pub async fn due(pool: &SqlitePool, now: DateTime<Utc>, limit: u32) -> Result<Vec<DeferredRow>> {
    let rows = sqlx::query_as::<_, (String, String, String, i64, Option<String>)>(
        r#"
        SELECT id, identity_key, payload, attempts, last_error
        FROM deferred_sync
        WHERE status = 'pending' AND next_attempt_at <= ?
        ORDER BY next_attempt_at
        LIMIT ?
        "#,
    )
    .bind(now.to_rfc3339())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, identity_key, payload, attempts, last_error)| DeferredRow {
            id,
            identity_key,
            payload,
            attempts: attempts.max(0) as u32,
            last_error,
        })
        .collect())
}

/// Push an entry's next attempt into the future after a failed replay
pub async fn reschedule(
    pool: &SqlitePool,
    id: &str,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE deferred_sync SET attempts = ?, next_attempt_at = ?, last_error = ? WHERE id = ?",
    )
    .bind(attempts)
    .bind(next_attempt_at.to_rfc3339())
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Move an entry to a terminal status
pub async fn finish(pool: &SqlitePool, id: &str, status: &str, error: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE deferred_sync SET status = ?, last_error = COALESCE(?, last_error) WHERE id = ?")
        .bind(status)
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Count entries in a given status, for diagnostics and tests
pub async fn count_by_status(pool: &SqlitePool, status: &str) -> Result<u32> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM deferred_sync WHERE status = ?")
            .bind(status)
            .fetch_one(pool)
            .await?;
    Ok(count.max(0) as u32)
}
