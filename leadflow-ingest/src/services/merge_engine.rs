//! Attribution Merge Engine
//!
//! Combines a new touchpoint with a contact's existing attribution
//! snapshot. The one non-negotiable invariant: `first_touch` is set
//! when the contact is created and never replaced afterwards, while
//! `last_touch` moves on every touchpoint regardless of channel.
//! Concurrent writers are handled with an optimistic-concurrency loop:
//! apply against the version read at resolution time, and on a
//! conditional-write conflict retry the whole merge from a fresh read,
//! a bounded number of times.

use chrono::{DateTime, Utc};
use leadflow_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::{
    AttributionSnapshot, Contact, ContactProfile, CrmId, IdentityKeys, LeadScore, Touchpoint,
};
use crate::services::crm_client::{ContactUpdate, CreateOutcome, StoredContact};
use crate::services::crm_sync::SyncAdapter;
use crate::services::identity_resolver::Resolution;

/// One unit of merge work. Serializable so a unit whose CRM sync could
/// not complete inline can be queued and replayed by the reconciler.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MergeRequest {
    pub identity: IdentityKeys,
    pub profile: ContactProfile,
    pub touchpoint: Touchpoint,
    /// First touch recovered from the browser-persisted store, honored
    /// only when this merge creates the contact
    pub recovered_first_touch: Option<Touchpoint>,
    /// Scoring result to record alongside the merge, when the inbound
    /// event was a qualifying form
    pub score: Option<LeadScore>,
}

/// What the merge did
#[derive(Debug)]
pub enum MergeOutcome {
    Created { crm_id: CrmId, contact: Contact },
    Updated { crm_id: CrmId, contact: Contact },
}

impl MergeOutcome {
    pub fn crm_id(&self) -> &CrmId {
        match self {
            MergeOutcome::Created { crm_id, .. } | MergeOutcome::Updated { crm_id, .. } => crm_id,
        }
    }

    pub fn contact(&self) -> &Contact {
        match self {
            MergeOutcome::Created { contact, .. } | MergeOutcome::Updated { contact, .. } => {
                contact
            }
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, MergeOutcome::Created { .. })
    }
}

pub struct MergeEngine {
    sync: Arc<SyncAdapter>,
    /// Bounded optimistic-concurrency retries before surfacing a conflict
    max_retries: u32,
}

impl MergeEngine {
    pub fn new(sync: Arc<SyncAdapter>, max_retries: u32) -> Self {
        Self { sync, max_retries }
    }

    /// Apply one touchpoint to the resolved contact state
    pub async fn apply(
        &self,
        resolution: Resolution,
        request: MergeRequest,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        match resolution.contact {
            None => self.create(request, now).await,
            Some(existing) => self.merge_into(existing, &request, now).await,
        }
    }

    async fn create(&self, request: MergeRequest, now: DateTime<Utc>) -> Result<MergeOutcome> {
        let snapshot = match request.recovered_first_touch.clone() {
            Some(first) => {
                AttributionSnapshot::with_recovered_first_touch(first, request.touchpoint.clone())
            }
            None => AttributionSnapshot::new(request.touchpoint.clone()),
        };

        let mut contact = Contact::new(
            request.identity.clone(),
            request.profile.clone(),
            snapshot,
            now,
        );
        if let Some(score) = &request.score {
            contact.lead_score = Some(score.score);
            contact.quality_tier = Some(score.tier);
        }

        match self.sync.create(&contact).await? {
            CreateOutcome::Created(crm_id) => {
                contact.crm_id = Some(crm_id.clone());
                info!(
                    crm_id = %crm_id,
                    identity = %contact.identity.primary_key(),
                    "Contact created"
                );
                Ok(MergeOutcome::Created { crm_id, contact })
            }
            CreateOutcome::AlreadyExists(existing) => {
                // Lost a create race: the second event merges into the
                // winner's contact rather than duplicating it
                debug!(
                    crm_id = %existing.crm_id,
                    identity = %contact.identity.primary_key(),
                    "Create raced an existing contact, merging instead"
                );
                self.merge_into(existing, &request, now).await
            }
        }
    }

    async fn merge_into(
        &self,
        existing: StoredContact,
        request: &MergeRequest,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let mut stored = existing;
        let mut attempt = 0u32;

        loop {
            let expected_version = stored.contact.attribution.version;
            let mut merged = stored.contact.clone();

            // last_touch moves unconditionally; first_touch is untouchable
            merged.attribution.absorb(request.touchpoint.clone());

            let profile_changed = refresh_profile(&mut merged, &request.profile);
            let score_changed = match &request.score {
                Some(score) => {
                    merged.lead_score = Some(score.score);
                    merged.quality_tier = Some(score.tier);
                    true
                }
                None => false,
            };
            merged.last_modified_at = now;

            let update = ContactUpdate {
                crm_id: stored.crm_id.clone(),
                contact: merged.clone(),
                expected_version,
                score_changed,
                profile_changed,
            };

            match self.sync.update(&update).await {
                Ok(()) => {
                    info!(
                        crm_id = %stored.crm_id,
                        touch_count = merged.attribution.touch_count,
                        "Contact merged"
                    );
                    return Ok(MergeOutcome::Updated {
                        crm_id: stored.crm_id,
                        contact: merged,
                    });
                }
                Err(Error::Conflict(reason)) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        return Err(Error::Conflict(format!(
                            "Merge retries exhausted after {} attempts: {}",
                            attempt, reason
                        )));
                    }
                    debug!(
                        crm_id = %stored.crm_id,
                        attempt = attempt,
                        "Merge conflicted, retrying from fresh read"
                    );
                    stored = self.fresh_read(&request.identity).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fresh_read(&self, identity: &IdentityKeys) -> Result<StoredContact> {
        let store = self.sync.store();
        if let Some(phone) = &identity.phone {
            if let Some(found) = store.lookup_by_phone(phone).await? {
                return Ok(found);
            }
        }
        if let Some(email) = &identity.email {
            if let Some(found) = store.lookup_by_email(email).await? {
                return Ok(found);
            }
        }
        Err(Error::Internal(format!(
            "Contact vanished during merge retry: {}",
            identity.primary_key()
        )))
    }
}

/// Fold the inbound profile into the stored one. Returns whether
/// anything changed. An arriving client id also clears the
/// `needs_attribution_update` flag: the contact now has its durable
/// cross-session identifier.
fn refresh_profile(contact: &mut Contact, incoming: &ContactProfile) -> bool {
    let before_profile = contact.profile.clone();
    let before_flag = contact.needs_attribution_update;

    if !incoming.first_name.is_empty() {
        contact.profile.first_name = incoming.first_name.clone();
    }
    if !incoming.last_name.is_empty() {
        contact.profile.last_name = incoming.last_name.clone();
    }
    if incoming.preferred_course.is_some() {
        contact.profile.preferred_course = incoming.preferred_course.clone();
    }
    if incoming.client_id.is_some() {
        contact.profile.client_id = incoming.client_id.clone();
        contact.needs_attribution_update = false;
    }
    if incoming.qualification_summary.is_some() {
        contact.profile.qualification_summary = incoming.qualification_summary.clone();
    }

    contact.profile != before_profile || contact.needs_attribution_update != before_flag
}
