//! Work-state database for leadflow-ingest
//!
//! SQLite holds the service-local state the CRM cannot: processed-
//! payload dedup keys, the deferred-reconciliation queue, and the
//! append-only conversion-event log. The CRM remains the only store of
//! contact state.

pub mod conversions;
pub mod dedup;
pub mod deferred;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Initialize leadflow-ingest tables
async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_payloads (
            dedup_key TEXT PRIMARY KEY,
            processed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deferred_sync (
            id TEXT PRIMARY KEY,
            identity_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TEXT NOT NULL,
            last_error TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversion_events (
            event_id TEXT PRIMARY KEY,
            contact_ref TEXT NOT NULL,
            value_usd INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            click_id TEXT,
            occurred_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    // Single connection: every connection to :memory: is its own database
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    init_tables(&pool).await.expect("table init");
    pool
}
