//! Deferred reconciliation sweep
//!
//! The only long-lived background work in the service: a periodic tick
//! that leases due entries from the deferred queue and replays their
//! merge through the normal pipeline stages. A queued unit whose
//! contact has since absorbed a newer touchpoint is stale and abandons
//! its write instead of overwriting newer state.

use chrono::Utc;
use leadflow_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::db::deferred::{self, DeferredRow};
use crate::services::crm_client::ContactStore;
use crate::services::crm_sync::RetryPolicy;
use crate::services::identity_resolver;
use crate::services::merge_engine::{MergeEngine, MergeRequest};

const SWEEP_BATCH: u32 = 20;

pub struct Reconciler {
    db: SqlitePool,
    store: Arc<dyn ContactStore>,
    merge: Arc<MergeEngine>,
    /// Schedule for spacing replay attempts
    policy: RetryPolicy,
    /// Replay attempts before an entry is parked as dead
    max_attempts: u32,
}

impl Reconciler {
    pub fn new(
        db: SqlitePool,
        store: Arc<dyn ContactStore>,
        merge: Arc<MergeEngine>,
        policy: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            db,
            store,
            merge,
            policy,
            max_attempts,
        }
    }

    /// Run the sweep loop until the process exits
    pub fn spawn(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = self.sweep_once().await {
                    error!(error = %err, "Reconciliation sweep failed");
                }
            }
        })
    }

    /// Replay every due entry once. Returns the number processed.
    pub async fn sweep_once(&self) -> Result<usize> {
        let rows = deferred::due(&self.db, Utc::now(), SWEEP_BATCH).await?;
        let count = rows.len();
        if count > 0 {
            debug!(count, "Reconciliation sweep picked up deferred entries");
        }
        for row in rows {
            self.replay(row).await?;
        }
        Ok(count)
    }

    async fn replay(&self, row: DeferredRow) -> Result<()> {
        let request: MergeRequest = match serde_json::from_str(&row.payload) {
            Ok(request) => request,
            Err(err) => {
                error!(id = %row.id, error = %err, "Deferred payload unreadable, parking as dead");
                deferred::finish(
                    &self.db,
                    &row.id,
                    deferred::STATUS_DEAD,
                    Some(&format!("payload parse: {}", err)),
                )
                .await?;
                return Ok(());
            }
        };

        let resolution =
            match identity_resolver::resolve(&self.store, &request.identity).await {
                Ok(resolution) => resolution,
                Err(err) => return self.reschedule(row, &err.to_string()).await,
            };

        // Staleness check: a newer touchpoint already landed for this
        // identity, so replaying this one would roll last-touch back
        if let Some(stored) = &resolution.contact {
            if stored.contact.attribution.last_touch.captured_at >= request.touchpoint.captured_at
            {
                info!(
                    id = %row.id,
                    identity = %row.identity_key,
                    "Deferred entry superseded by newer state, abandoning"
                );
                deferred::finish(&self.db, &row.id, deferred::STATUS_SUPERSEDED, None).await?;
                return Ok(());
            }
        }

        match self.merge.apply(resolution, request, Utc::now()).await {
            Ok(outcome) => {
                info!(
                    id = %row.id,
                    crm_id = %outcome.crm_id(),
                    "Deferred entry reconciled"
                );
                deferred::finish(&self.db, &row.id, deferred::STATUS_DONE, None).await?;
                Ok(())
            }
            Err(err) if matches!(err, Error::Conflict(_)) || err.is_retryable() => {
                self.reschedule(row, &err.to_string()).await
            }
            Err(err) => {
                error!(id = %row.id, error = %err, "Deferred entry failed permanently");
                deferred::finish(
                    &self.db,
                    &row.id,
                    deferred::STATUS_DEAD,
                    Some(&err.to_string()),
                )
                .await?;
                Ok(())
            }
        }
    }

    async fn reschedule(&self, row: DeferredRow, reason: &str) -> Result<()> {
        let attempts = row.attempts + 1;
        if attempts >= self.max_attempts {
            error!(
                id = %row.id,
                identity = %row.identity_key,
                attempts,
                "Deferred entry reached attempt cap, parking as dead"
            );
            deferred::finish(&self.db, &row.id, deferred::STATUS_DEAD, Some(reason)).await?;
            return Ok(());
        }
        let next = Utc::now() + chrono::Duration::milliseconds(self.policy.delay(attempts).as_millis() as i64);
        warn!(
            id = %row.id,
            attempts,
            next = %next,
            reason = %reason,
            "Deferred entry rescheduled"
        );
        deferred::reschedule(&self.db, &row.id, attempts, next, reason).await
    }
}
