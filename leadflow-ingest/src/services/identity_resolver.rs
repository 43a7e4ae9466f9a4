//! Identity Resolver
//!
//! Exact-match identity resolution against the CRM on normalized
//! phone/email keys. Normalization happens in the model constructors
//! before this module ever runs a lookup; the resolver's job is to
//! issue both lookups concurrently and apply the conflict rule when
//! they disagree.

use leadflow_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::IdentityKeys;
use crate::services::crm_client::{ContactStore, StoredContact};
use crate::services::crm_sync::RetryPolicy;

/// Resolution verdict for one inbound identity
#[derive(Debug)]
pub struct Resolution {
    pub contact: Option<StoredContact>,
    pub matched: bool,
}

/// Resolve an identity against the CRM
///
/// Phone and email lookups run concurrently and are joined before
/// proceeding. When both match different contacts the phone match wins
/// (phone is the less substitutable identity in this domain) and the
/// conflict is logged. CRM unavailability propagates as
/// `Error::Lookup`; it is never downgraded to "not found", since that
/// would risk duplicate-contact creation downstream.
pub async fn resolve(store: &Arc<dyn ContactStore>, identity: &IdentityKeys) -> Result<Resolution> {
    let (phone_result, email_result) = tokio::join!(
        async {
            match &identity.phone {
                Some(phone) => store.lookup_by_phone(phone).await,
                None => Ok(None),
            }
        },
        async {
            match &identity.email {
                Some(email) => store.lookup_by_email(email).await,
                None => Ok(None),
            }
        },
    );

    let by_phone = phone_result?;
    let by_email = email_result?;

    let contact = match (by_phone, by_email) {
        (Some(phone_match), Some(email_match)) => {
            if phone_match.crm_id != email_match.crm_id {
                warn!(
                    phone_crm_id = %phone_match.crm_id,
                    email_crm_id = %email_match.crm_id,
                    "Phone and email resolved to different contacts; preferring phone match"
                );
            }
            Some(phone_match)
        }
        (Some(found), None) | (None, Some(found)) => Some(found),
        (None, None) => None,
    };

    let matched = contact.is_some();
    debug!(identity = %identity.primary_key(), matched, "Identity resolution complete");
    Ok(Resolution { contact, matched })
}

/// Resolve with bounded retry on lookup failure
///
/// Callers must retry a failed lookup before falling through to
/// contact creation; this helper owns that loop. Exhausted retries
/// surface the last `Error::Lookup` so the unit of work can be
/// deferred rather than mis-filed as a new contact.
pub async fn resolve_retrying(
    store: &Arc<dyn ContactStore>,
    identity: &IdentityKeys,
    policy: &RetryPolicy,
) -> Result<Resolution> {
    let mut attempt = 1u32;
    loop {
        match resolve(store, identity).await {
            Ok(resolution) => return Ok(resolution),
            Err(err @ Error::Lookup(_)) if attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Identity lookup failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
