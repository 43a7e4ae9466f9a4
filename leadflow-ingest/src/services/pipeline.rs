//! Lead ingestion pipeline
//!
//! Glue for one unit of work: dedup check, identity resolution with
//! lookup retry, merge, and the defer-instead-of-fail policy. The
//! inbound caller always gets a fast verdict; when the CRM cannot be
//! reached inline the unit is parked on the deferred queue and the
//! lead is still acknowledged: attribution correctness is eventually
//! consistent, lead acceptance is not.

use chrono::Utc;
use leadflow_common::events::{EventBus, LeadEvent};
use leadflow_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db;
use crate::models::{ConversionEvent, ConversionEventType, QualityTier};
use crate::services::conversion_emitter::ConversionEmitter;
use crate::services::crm_client::ContactStore;
use crate::services::crm_sync::RetryPolicy;
use crate::services::identity_resolver;
use crate::services::merge_engine::{MergeEngine, MergeOutcome, MergeRequest};
use crate::services::payload_dedup;

/// Verdict for one inbound unit of work
#[derive(Debug)]
pub enum IngestOutcome {
    /// Merge and CRM sync completed inline
    Completed(MergeOutcome),
    /// Lead accepted; CRM sync parked on the deferred queue
    Deferred { reason: String },
    /// Identical payload already processed; nothing changed
    Duplicate,
}

pub struct LeadPipeline {
    pub db: SqlitePool,
    pub store: Arc<dyn ContactStore>,
    pub merge: Arc<MergeEngine>,
    pub emitter: Arc<ConversionEmitter>,
    pub event_bus: EventBus,
    pub lookup_policy: RetryPolicy,
}

impl LeadPipeline {
    /// Run one unit of work through dedup, resolution, and merge
    pub async fn ingest(&self, request: MergeRequest) -> Result<IngestOutcome> {
        let now = Utc::now();
        let identity_key = request.identity.primary_key();

        let dedup_key = payload_dedup::dedup_key(&identity_key, &request.touchpoint);
        if !db::dedup::try_record(&self.db, &dedup_key, now).await? {
            info!(identity = %identity_key, "Duplicate payload delivery ignored");
            return Ok(IngestOutcome::Duplicate);
        }

        self.event_bus.publish(LeadEvent::LeadAccepted {
            unit_id: Uuid::new_v4(),
            identity_key: identity_key.clone(),
            channel: request.touchpoint.channel.as_str().to_string(),
            timestamp: now,
        });

        let resolution = match identity_resolver::resolve_retrying(
            &self.store,
            &request.identity,
            &self.lookup_policy,
        )
        .await
        {
            Ok(resolution) => resolution,
            Err(Error::Lookup(reason)) => {
                // Unresolvable is not "new": defer rather than risk a
                // duplicate contact
                return self.defer(request, &reason).await;
            }
            Err(err) => return Err(err),
        };

        match self.merge.apply(resolution, request.clone(), now).await {
            Ok(outcome) => {
                self.publish_merge(&outcome, now);
                Ok(IngestOutcome::Completed(outcome))
            }
            Err(err) if should_defer(&err) => {
                warn!(identity = %identity_key, error = %err, "Inline CRM sync failed, deferring");
                self.defer(request, &err.to_string()).await
            }
            Err(err) => Err(err),
        }
    }

    /// Append a conversion for a processed unit of work and forward it
    /// to the configured ad platforms
    pub async fn record_conversion(
        &self,
        request: &MergeRequest,
        outcome: &IngestOutcome,
        event_type: ConversionEventType,
    ) -> Result<()> {
        let identity_key = request.identity.primary_key();

        let value_usd = request
            .score
            .map(|s| s.conversion_value_usd)
            .unwrap_or_else(|| QualityTier::Unqualified.conversion_value_usd());

        // Prefer the merged contact's stored click id; a deferred unit
        // falls back to what the inbound payload carried
        let click_id = match outcome {
            IngestOutcome::Completed(merge) => merge.contact().stored_click_id().cloned(),
            _ => request
                .recovered_first_touch
                .as_ref()
                .and_then(|t| t.click_id.clone())
                .or_else(|| request.touchpoint.click_id.clone()),
        };

        let event = ConversionEvent::new(identity_key, value_usd, event_type, click_id, Utc::now());
        self.emitter.record_and_emit(event).await
    }

    async fn defer(&self, request: MergeRequest, reason: &str) -> Result<IngestOutcome> {
        let identity_key = request.identity.primary_key();
        let payload = serde_json::to_string(&request)
            .map_err(|e| Error::Internal(format!("Serialize deferred payload: {}", e)))?;

        db::deferred::enqueue(&self.db, &identity_key, &payload, reason, Utc::now()).await?;

        self.event_bus.publish(LeadEvent::SyncDeferred {
            identity_key: identity_key.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        info!(identity = %identity_key, reason = %reason, "Unit of work queued for deferred reconciliation");

        Ok(IngestOutcome::Deferred {
            reason: reason.to_string(),
        })
    }

    fn publish_merge(&self, outcome: &MergeOutcome, now: chrono::DateTime<Utc>) {
        match outcome {
            MergeOutcome::Created { crm_id, contact } => {
                self.event_bus.publish(LeadEvent::ContactCreated {
                    identity_key: contact.identity.primary_key(),
                    crm_id: crm_id.to_string(),
                    timestamp: now,
                });
            }
            MergeOutcome::Updated { crm_id, contact } => {
                self.event_bus.publish(LeadEvent::ContactUpdated {
                    identity_key: contact.identity.primary_key(),
                    crm_id: crm_id.to_string(),
                    touch_count: contact.attribution.touch_count,
                    timestamp: now,
                });
            }
        }
    }
}

/// Failures that park the unit of work instead of failing the lead:
/// exhausted conflict retries and retryable sync failures (including a
/// fast-failed open circuit). Validation and payload rejections are
/// not deferrable.
fn should_defer(err: &Error) -> bool {
    match err {
        Error::Conflict(_) => true,
        Error::Lookup(_) => true,
        Error::Sync { retryable, .. } => *retryable,
        _ => false,
    }
}

impl std::fmt::Debug for LeadPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadPipeline").finish_non_exhaustive()
    }
}

/// Log-and-continue wrapper used by handlers for conversion recording;
/// a failed log append must not fail an already-accepted lead
pub async fn record_conversion_best_effort(
    pipeline: &LeadPipeline,
    request: &MergeRequest,
    outcome: &IngestOutcome,
    event_type: ConversionEventType,
) {
    if let Err(err) = pipeline.record_conversion(request, outcome, event_type).await {
        error!(error = %err, "Conversion recording failed");
    }
}
