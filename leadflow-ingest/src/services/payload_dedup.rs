//! Duplicate-delivery detection
//!
//! Webhook transports redeliver on slow acknowledgments, and browsers
//! double-submit forms. Each unit of work gets a SHA-256 key over its
//! identity and canonical touchpoint fields; a key already recorded in
//! the work-state database means the identical payload was processed
//! before, so `touch_count` increments exactly once per distinct
//! touchpoint.

use sha2::{Digest, Sha256};

use crate::models::Touchpoint;

/// Stable dedup key for one inbound payload
pub fn dedup_key(identity_key: &str, touchpoint: &Touchpoint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity_key.as_bytes());
    for part in [
        touchpoint.source.as_str(),
        touchpoint.medium.as_str(),
        touchpoint.campaign.as_deref().unwrap_or(""),
        touchpoint.term.as_deref().unwrap_or(""),
        touchpoint.content.as_deref().unwrap_or(""),
        touchpoint
            .click_id
            .as_ref()
            .map(|c| c.token())
            .unwrap_or(""),
        touchpoint.channel.as_str(),
    ] {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(touchpoint.captured_at.to_rfc3339().as_bytes());

    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
