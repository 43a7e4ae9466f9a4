//! Touchpoint and attribution snapshot models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Marketing channel of a touchpoint
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    PaidSearch,
    PaidSocial,
    Organic,
    Direct,
    Messaging,
    Referral,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::PaidSearch => "paid-search",
            Channel::PaidSocial => "paid-social",
            Channel::Organic => "organic",
            Channel::Direct => "direct",
            Channel::Messaging => "messaging",
            Channel::Referral => "referral",
        }
    }

    /// Parse the kebab-case form produced by [`Channel::as_str`]
    pub fn parse(raw: &str) -> Option<Channel> {
        match raw {
            "paid-search" => Some(Channel::PaidSearch),
            "paid-social" => Some(Channel::PaidSocial),
            "organic" => Some(Channel::Organic),
            "direct" => Some(Channel::Direct),
            "messaging" => Some(Channel::Messaging),
            "referral" => Some(Channel::Referral),
            _ => None,
        }
    }
}

/// Platform-issued click identifier
///
/// At most one click id is populated per touchpoint. The variants cover
/// the click tokens ad platforms append to landing URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", content = "token", rename_all = "snake_case")]
pub enum ClickId {
    Gclid(String),
    Gbraid(String),
    Wbraid(String),
    Fbclid(String),
    Msclkid(String),
}

impl ClickId {
    /// URL parameter name this click id arrives under
    pub fn param_name(&self) -> &'static str {
        match self {
            ClickId::Gclid(_) => "gclid",
            ClickId::Gbraid(_) => "gbraid",
            ClickId::Wbraid(_) => "wbraid",
            ClickId::Fbclid(_) => "fbclid",
            ClickId::Msclkid(_) => "msclkid",
        }
    }

    pub fn token(&self) -> &str {
        match self {
            ClickId::Gclid(t)
            | ClickId::Gbraid(t)
            | ClickId::Wbraid(t)
            | ClickId::Fbclid(t)
            | ClickId::Msclkid(t) => t,
        }
    }

    /// Channel implied by the click id when no explicit UTMs are present
    pub fn implied_channel(&self) -> Channel {
        match self {
            ClickId::Gclid(_) | ClickId::Gbraid(_) | ClickId::Wbraid(_) | ClickId::Msclkid(_) => {
                Channel::PaidSearch
            }
            ClickId::Fbclid(_) => Channel::PaidSocial,
        }
    }

    /// Source implied by the click id when no explicit UTMs are present
    pub fn implied_source(&self) -> &'static str {
        match self {
            ClickId::Gclid(_) | ClickId::Gbraid(_) | ClickId::Wbraid(_) => "google",
            ClickId::Fbclid(_) => "facebook",
            ClickId::Msclkid(_) => "bing",
        }
    }

    /// Build from a URL parameter name and token
    pub fn from_param(name: &str, token: &str) -> Option<ClickId> {
        let token = token.to_string();
        match name {
            "gclid" => Some(ClickId::Gclid(token)),
            "gbraid" => Some(ClickId::Gbraid(token)),
            "wbraid" => Some(ClickId::Wbraid(token)),
            "fbclid" => Some(ClickId::Fbclid(token)),
            "msclkid" => Some(ClickId::Msclkid(token)),
            _ => None,
        }
    }
}

/// One marketing-attributable interaction
///
/// Immutable once persisted: merges replace the snapshot's `last_touch`
/// reference, they never edit a touchpoint in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Touchpoint {
    pub source: String,
    pub medium: String,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
    pub click_id: Option<ClickId>,
    pub channel: Channel,
    pub captured_at: DateTime<Utc>,
    /// Unrecognized inbound fields, preserved verbatim for audit.
    /// Never consulted by merge or scoring logic.
    #[serde(default)]
    pub raw_params: BTreeMap<String, String>,
}

/// Attribution state owned by exactly one contact
///
/// `first_touch` is write-once: it is set when the snapshot is created
/// and the field is private so no later code path can replace it.
/// Every subsequent touchpoint flows through [`AttributionSnapshot::absorb`],
/// which only moves `last_touch` and the counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionSnapshot {
    first_touch: Touchpoint,
    pub last_touch: Touchpoint,
    pub touch_count: u32,
    pub channels_seen: BTreeSet<Channel>,
    /// Optimistic-concurrency token, bumped on every mutation
    pub version: u64,
}

impl AttributionSnapshot {
    /// Seed a snapshot from the contact's first observed touchpoint
    pub fn new(seed: Touchpoint) -> Self {
        let mut channels_seen = BTreeSet::new();
        channels_seen.insert(seed.channel);
        Self {
            first_touch: seed.clone(),
            last_touch: seed,
            touch_count: 1,
            channels_seen,
            version: 1,
        }
    }

    /// Seed a snapshot whose first touch was recovered from a
    /// browser-persisted store (an earlier anonymous visit) while the
    /// current touchpoint becomes the last touch.
    pub fn with_recovered_first_touch(first: Touchpoint, last: Touchpoint) -> Self {
        let mut channels_seen = BTreeSet::new();
        channels_seen.insert(first.channel);
        channels_seen.insert(last.channel);
        Self {
            first_touch: first,
            last_touch: last,
            touch_count: 2,
            channels_seen,
            version: 1,
        }
    }

    /// Rehydrate a snapshot read back from the CRM. Construction only:
    /// `first_touch` remains unreplaceable after this.
    pub fn from_parts(
        first_touch: Touchpoint,
        last_touch: Touchpoint,
        touch_count: u32,
        channels_seen: BTreeSet<Channel>,
        version: u64,
    ) -> Self {
        let mut channels_seen = channels_seen;
        channels_seen.insert(first_touch.channel);
        channels_seen.insert(last_touch.channel);
        Self {
            first_touch,
            last_touch,
            touch_count,
            channels_seen,
            version,
        }
    }

    pub fn first_touch(&self) -> &Touchpoint {
        &self.first_touch
    }

    /// Absorb a new touchpoint: last touch moves, first touch never does
    pub fn absorb(&mut self, touchpoint: Touchpoint) {
        self.channels_seen.insert(touchpoint.channel);
        self.last_touch = touchpoint;
        self.touch_count += 1;
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touchpoint(source: &str, channel: Channel) -> Touchpoint {
        Touchpoint {
            source: source.to_string(),
            medium: "none".to_string(),
            campaign: None,
            term: None,
            content: None,
            click_id: None,
            channel,
            captured_at: Utc::now(),
            raw_params: BTreeMap::new(),
        }
    }

    #[test]
    fn test_absorb_moves_last_touch_only() {
        let mut snapshot = AttributionSnapshot::new(touchpoint("google", Channel::PaidSearch));
        snapshot.absorb(touchpoint("whatsapp", Channel::Messaging));

        assert_eq!(snapshot.first_touch().source, "google");
        assert_eq!(snapshot.last_touch.source, "whatsapp");
        assert_eq!(snapshot.touch_count, 2);
        assert_eq!(snapshot.version, 2);
        assert!(snapshot.channels_seen.contains(&Channel::PaidSearch));
        assert!(snapshot.channels_seen.contains(&Channel::Messaging));
    }

    #[test]
    fn test_version_increments_on_every_mutation() {
        let mut snapshot = AttributionSnapshot::new(touchpoint("direct", Channel::Direct));
        assert_eq!(snapshot.version, 1);
        snapshot.absorb(touchpoint("google", Channel::Organic));
        snapshot.absorb(touchpoint("facebook", Channel::Referral));
        assert_eq!(snapshot.version, 3);
        assert_eq!(snapshot.touch_count, 3);
    }

    #[test]
    fn test_recovered_first_touch_counts_both() {
        let first = touchpoint("google", Channel::PaidSearch);
        let last = touchpoint("whatsapp", Channel::Messaging);
        let snapshot = AttributionSnapshot::with_recovered_first_touch(first, last);
        assert_eq!(snapshot.touch_count, 2);
        assert_eq!(snapshot.first_touch().source, "google");
        assert_eq!(snapshot.last_touch.source, "whatsapp");
    }

    #[test]
    fn test_click_id_implied_attribution() {
        let gclid = ClickId::from_param("gclid", "abc123").unwrap();
        assert_eq!(gclid.implied_source(), "google");
        assert_eq!(gclid.implied_channel(), Channel::PaidSearch);

        let fbclid = ClickId::from_param("fbclid", "xyz").unwrap();
        assert_eq!(fbclid.implied_source(), "facebook");
        assert_eq!(fbclid.implied_channel(), Channel::PaidSocial);

        assert!(ClickId::from_param("ttclid", "nope").is_none());
    }

    #[test]
    fn test_channel_round_trip() {
        for channel in [
            Channel::PaidSearch,
            Channel::PaidSocial,
            Channel::Organic,
            Channel::Direct,
            Channel::Messaging,
            Channel::Referral,
        ] {
            assert_eq!(Channel::parse(channel.as_str()), Some(channel));
        }
    }
}
