//! Contact identity and CRM attribute mapping
//!
//! Identity keys are normalized before any lookup: phone numbers to
//! E.164 digits, emails to lowercase-trimmed form. The normalized forms
//! are the sole CRM dedup key, so the normalization rules here are a
//! tested contract rather than an implementation detail.

use chrono::{DateTime, Utc};
use leadflow_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::lead_score::QualityTier;
use super::touchpoint::{AttributionSnapshot, ClickId, Touchpoint};

/// CRM record identifier, assigned by the CRM on create and never changed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrmId(pub String);

impl fmt::Display for CrmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Phone number normalized to E.164 digits
///
/// Accepted inbound forms, all mapping to the same key:
/// `0711486581` (national with leading zero), `711486581` (bare
/// subscriber number), `254711486581`, `+254 711 486 581`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedPhone(String);

impl NormalizedPhone {
    /// Normalize a raw phone string using the configured country code
    pub fn parse(raw: &str, country_code: &str) -> Result<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

        if digits.is_empty() {
            return Err(Error::Validation(format!(
                "Phone number has no digits: {:?}",
                raw
            )));
        }

        let normalized = if digits.starts_with('0') && digits.len() == 10 {
            // National format: drop the leading zero, attach country code
            format!("{}{}", country_code, &digits[1..])
        } else if digits.len() == 9 {
            // Bare subscriber number
            format!("{}{}", country_code, digits)
        } else if digits.starts_with(country_code) {
            digits
        } else {
            digits
        };

        // E.164 allows at most 15 digits; anything shorter than a
        // country code plus subscriber number cannot be a real line
        if normalized.len() < 10 || normalized.len() > 15 {
            return Err(Error::Validation(format!(
                "Phone number is not a valid E.164 number: {:?}",
                raw
            )));
        }

        Ok(Self(normalized))
    }

    /// Digits-only key used for CRM dedup lookups
    pub fn key(&self) -> &str {
        &self.0
    }

    /// E.164 rendering with the leading plus
    pub fn e164(&self) -> String {
        format!("+{}", self.0)
    }
}

impl fmt::Display for NormalizedPhone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}", self.0)
    }
}

/// Email address normalized to lowercase-trimmed form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedEmail(String);

impl NormalizedEmail {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase();

        let mut parts = normalized.splitn(2, '@');
        let local = parts.next().unwrap_or_default();
        let domain = parts.next().unwrap_or_default();
        if local.is_empty() || domain.is_empty() || !domain.contains('.') || domain.contains('@') {
            return Err(Error::Validation(format!(
                "Invalid email address: {:?}",
                raw
            )));
        }

        Ok(Self(normalized))
    }

    pub fn key(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Normalized identity keys of a contact. At least one is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    pub email: Option<NormalizedEmail>,
    pub phone: Option<NormalizedPhone>,
}

impl IdentityKeys {
    pub fn new(email: Option<NormalizedEmail>, phone: Option<NormalizedPhone>) -> Result<Self> {
        if email.is_none() && phone.is_none() {
            return Err(Error::Validation(
                "Contact requires at least one identity key (email or phone)".to_string(),
            ));
        }
        Ok(Self { email, phone })
    }

    /// The key used to correlate a unit of work in logs and queues.
    /// Phone wins when both are present: it is the less substitutable
    /// identity in this domain.
    pub fn primary_key(&self) -> String {
        if let Some(phone) = &self.phone {
            phone.key().to_string()
        } else if let Some(email) = &self.email {
            email.key().to_string()
        } else {
            // Constructor guarantees at least one key
            String::new()
        }
    }
}

/// Non-attribution contact fields pushed to the CRM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactProfile {
    pub first_name: String,
    pub last_name: String,
    pub preferred_course: Option<String>,
    /// Browser-persisted analytics client id; the durable
    /// cross-session identifier used for attribution backfill
    pub client_id: Option<String>,
    /// Human-readable summary of the latest qualification answers
    pub qualification_summary: Option<String>,
}

/// The unit of CRM identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub identity: IdentityKeys,
    pub crm_id: Option<CrmId>,
    pub attribution: AttributionSnapshot,
    pub lead_score: Option<u8>,
    pub quality_tier: Option<QualityTier>,
    /// Set when the contact was created without a durable cross-session
    /// identifier; cleared when a later interaction supplies one
    pub needs_attribution_update: bool,
    pub profile: ContactProfile,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl Contact {
    /// Create a contact from its first identity-linked touchpoint
    pub fn new(
        identity: IdentityKeys,
        profile: ContactProfile,
        attribution: AttributionSnapshot,
        now: DateTime<Utc>,
    ) -> Self {
        let needs_attribution_update = profile.client_id.is_none();
        Self {
            identity,
            crm_id: None,
            attribution,
            lead_score: None,
            quality_tier: None,
            needs_attribution_update,
            profile,
            created_at: now,
            last_modified_at: now,
        }
    }

    /// First click id known for this contact, preferring the first touch
    /// (the ad click that originally brought them)
    pub fn stored_click_id(&self) -> Option<&ClickId> {
        self.attribution
            .first_touch()
            .click_id
            .as_ref()
            .or(self.attribution.last_touch.click_id.as_ref())
    }

    /// Attribution attribute set for the CRM, always sent on merge
    pub fn attribution_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        let last = &self.attribution.last_touch;
        let first = self.attribution.first_touch();

        insert_touch(&mut attrs, "UTM", last);
        attrs.insert("LAST_TOUCH_CHANNEL".to_string(), last.channel.as_str().to_string());
        attrs.insert("LAST_TOUCH_TIMESTAMP".to_string(), last.captured_at.to_rfc3339());

        insert_touch(&mut attrs, "FIRST_TOUCH", first);
        attrs.insert("FIRST_TOUCH_CHANNEL".to_string(), first.channel.as_str().to_string());
        attrs.insert("FIRST_TOUCH_TIMESTAMP".to_string(), first.captured_at.to_rfc3339());

        if let Some(click_id) = self.stored_click_id() {
            let key = match click_id {
                ClickId::Fbclid(_) => "FBCLID",
                _ => "GCLID",
            };
            attrs.insert(key.to_string(), click_id.token().to_string());
        }

        attrs.insert("TOUCH_COUNT".to_string(), self.attribution.touch_count.to_string());
        attrs.insert(
            "CHANNELS_SEEN".to_string(),
            self.attribution
                .channels_seen
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );
        attrs.insert(
            "NEEDS_ATTRIBUTION_UPDATE".to_string(),
            self.needs_attribution_update.to_string(),
        );
        attrs.insert(
            "ATTRIBUTION_VERSION".to_string(),
            self.attribution.version.to_string(),
        );
        attrs
    }

    /// Profile attribute set, sent on create and when the profile changed
    pub fn profile_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert("FIRSTNAME".to_string(), self.profile.first_name.clone());
        attrs.insert("LASTNAME".to_string(), self.profile.last_name.clone());
        if let Some(email) = &self.identity.email {
            attrs.insert("EMAIL".to_string(), email.key().to_string());
        }
        if let Some(phone) = &self.identity.phone {
            attrs.insert("SMS".to_string(), phone.e164());
        }
        if let Some(course) = &self.profile.preferred_course {
            attrs.insert("PREFERRED_COURSE".to_string(), course.clone());
        }
        if let Some(client_id) = &self.profile.client_id {
            attrs.insert("CLIENT_ID".to_string(), client_id.clone());
        }
        if let Some(summary) = &self.profile.qualification_summary {
            attrs.insert("CONVERSATION_SUMMARY".to_string(), summary.clone());
        }
        attrs
    }

    /// Score attribute set, sent only when a scoring event occurred
    pub fn score_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        if let Some(score) = self.lead_score {
            attrs.insert("LEAD_SCORE".to_string(), score.to_string());
        }
        if let Some(tier) = self.quality_tier {
            attrs.insert("QUALIFICATION_STATUS".to_string(), tier.label().to_string());
        }
        attrs
    }
}

fn insert_touch(attrs: &mut BTreeMap<String, String>, prefix: &str, touch: &Touchpoint) {
    attrs.insert(format!("{}_SOURCE", prefix), touch.source.clone());
    attrs.insert(format!("{}_MEDIUM", prefix), touch.medium.clone());
    attrs.insert(
        format!("{}_CAMPAIGN", prefix),
        touch.campaign.clone().unwrap_or_default(),
    );
    attrs.insert(
        format!("{}_TERM", prefix),
        touch.term.clone().unwrap_or_default(),
    );
    attrs.insert(
        format!("{}_CONTENT", prefix),
        touch.content.clone().unwrap_or_default(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::touchpoint::Channel;
    use std::collections::BTreeMap as Map;

    fn touchpoint(source: &str, channel: Channel, click_id: Option<ClickId>) -> Touchpoint {
        Touchpoint {
            source: source.to_string(),
            medium: "cpc".to_string(),
            campaign: Some("launch".to_string()),
            term: None,
            content: None,
            click_id,
            channel,
            captured_at: Utc::now(),
            raw_params: Map::new(),
        }
    }

    #[test]
    fn test_phone_normalization_equivalence() {
        let forms = ["0711486581", "+254711486581", "254711486581", "711486581"];
        let keys: Vec<String> = forms
            .iter()
            .map(|raw| NormalizedPhone::parse(raw, "254").unwrap().key().to_string())
            .collect();
        assert!(keys.iter().all(|k| k == "254711486581"));
    }

    #[test]
    fn test_phone_e164_rendering() {
        let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
        assert_eq!(phone.e164(), "+254711486581");
    }

    #[test]
    fn test_phone_rejects_garbage() {
        assert!(NormalizedPhone::parse("call me", "254").is_err());
        assert!(NormalizedPhone::parse("12345", "254").is_err());
        assert!(NormalizedPhone::parse("", "254").is_err());
    }

    #[test]
    fn test_email_normalization() {
        let email = NormalizedEmail::parse("  John.Doe@Example.COM ").unwrap();
        assert_eq!(email.key(), "john.doe@example.com");

        assert!(NormalizedEmail::parse("not-an-email").is_err());
        assert!(NormalizedEmail::parse("@example.com").is_err());
        assert!(NormalizedEmail::parse("user@nodot").is_err());
    }

    #[test]
    fn test_identity_requires_at_least_one_key() {
        assert!(IdentityKeys::new(None, None).is_err());

        let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
        let identity = IdentityKeys::new(None, Some(phone)).unwrap();
        assert_eq!(identity.primary_key(), "254711486581");
    }

    #[test]
    fn test_primary_key_prefers_phone() {
        let email = NormalizedEmail::parse("a@b.co").unwrap();
        let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
        let identity = IdentityKeys::new(Some(email), Some(phone)).unwrap();
        assert_eq!(identity.primary_key(), "254711486581");
    }

    #[test]
    fn test_new_contact_flags_missing_client_id() {
        let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
        let identity = IdentityKeys::new(None, Some(phone)).unwrap();
        let snapshot = AttributionSnapshot::new(touchpoint("whatsapp", Channel::Messaging, None));
        let contact = Contact::new(identity, ContactProfile::default(), snapshot, Utc::now());
        assert!(contact.needs_attribution_update);
    }

    #[test]
    fn test_attribution_attributes_carry_both_touches() {
        let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
        let identity = IdentityKeys::new(None, Some(phone)).unwrap();
        let first = touchpoint(
            "google",
            Channel::PaidSearch,
            Some(ClickId::Gclid("abc123".to_string())),
        );
        let mut snapshot = AttributionSnapshot::new(first);
        snapshot.absorb(touchpoint("whatsapp", Channel::Messaging, None));

        let contact = Contact::new(identity, ContactProfile::default(), snapshot, Utc::now());
        let attrs = contact.attribution_attributes();

        assert_eq!(attrs["FIRST_TOUCH_SOURCE"], "google");
        assert_eq!(attrs["UTM_SOURCE"], "whatsapp");
        assert_eq!(attrs["GCLID"], "abc123");
        assert_eq!(attrs["TOUCH_COUNT"], "2");
        assert_eq!(attrs["ATTRIBUTION_VERSION"], "2");
        assert_eq!(attrs["CHANNELS_SEEN"], "paid-search,messaging");
    }
}
