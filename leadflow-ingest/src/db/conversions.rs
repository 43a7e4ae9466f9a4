//! Append-only conversion-event log
//!
//! Events are inserted once and never updated or deleted; re-scoring a
//! contact appends a new row.

use chrono::{DateTime, Utc};
use leadflow_common::{Error, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{ClickId, ConversionEvent, ConversionEventType};

/// Append one conversion event
pub async fn append(pool: &SqlitePool, event: &ConversionEvent) -> Result<()> {
    let click_id = event
        .click_id
        .as_ref()
        .map(|c| format!("{}:{}", c.param_name(), c.token()));
    sqlx::query(
        r#"
        INSERT INTO conversion_events (event_id, contact_ref, value_usd, event_type, click_id, occurred_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.event_id.to_string())
    .bind(&event.contact_ref)
    .bind(event.value_usd)
    .bind(event.event_type.as_str())
    .bind(click_id)
    .bind(event.occurred_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// All events for a contact, oldest first
pub async fn for_contact(pool: &SqlitePool, contact_ref: &str) -> Result<Vec<ConversionEvent>> {
    let rows = sqlx::query_as::<_, (String, String, i64, String, Option<String>, String)>(
        r#"
        SELECT event_id, contact_ref, value_usd, event_type, click_id, occurred_at
        FROM conversion_events
        WHERE contact_ref = ?
        ORDER BY occurred_at
        "#,
    )
    .bind(contact_ref)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(event_id, contact_ref, value_usd, event_type, click_id, occurred_at)| {
            Ok(ConversionEvent {
                event_id: Uuid::parse_str(&event_id)
                    .map_err(|e| Error::Internal(format!("Bad event id in log: {}", e)))?,
                contact_ref,
                value_usd: value_usd.max(0) as u32,
                event_type: ConversionEventType::parse(&event_type).ok_or_else(|| {
                    Error::Internal(format!("Bad event type in log: {}", event_type))
                })?,
                click_id: click_id.as_deref().and_then(parse_click_id),
                occurred_at: DateTime::parse_from_rfc3339(&occurred_at)
                    .map_err(|e| Error::Internal(format!("Bad timestamp in log: {}", e)))?
                    .with_timezone(&Utc),
            })
        })
        .collect()
}

fn parse_click_id(raw: &str) -> Option<ClickId> {
    let (name, token) = raw.split_once(':')?;
    ClickId::from_param(name, token)
}
