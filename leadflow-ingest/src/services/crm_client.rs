//! CRM contact store
//!
//! The external CRM is consumed through the [`ContactStore`] seam:
//! lookup by normalized identity key, idempotent create, and a
//! conditional update keyed on the attribution version. Two
//! implementations live here: [`HttpCrm`] speaks the hosted CRM's REST
//! API (which has no native conditional writes, so version checks are
//! simulated behind a per-identity-key lock), and [`MemoryCrm`]
//! enforces the contract natively and serves as the test double.

use async_trait::async_trait;
use leadflow_common::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::models::{
    AttributionSnapshot, Channel, ClickId, Contact, ContactProfile, CrmId, IdentityKeys,
    NormalizedEmail, NormalizedPhone, QualityTier, Touchpoint,
};

/// Contact as stored in the CRM, with its record id
#[derive(Debug, Clone)]
pub struct StoredContact {
    pub crm_id: CrmId,
    pub contact: Contact,
}

/// Result of an idempotent create
#[derive(Debug)]
pub enum CreateOutcome {
    Created(CrmId),
    /// Another unit of work created this identity first; callers merge
    /// into the existing record instead
    AlreadyExists(StoredContact),
}

/// A pending conditional update
#[derive(Debug, Clone)]
pub struct ContactUpdate {
    pub crm_id: CrmId,
    /// Post-merge contact state
    pub contact: Contact,
    /// Version read immediately before the merge was applied
    pub expected_version: u64,
    /// Whether the score attribute group changed in this merge
    pub score_changed: bool,
    /// Whether the profile attribute group changed in this merge
    pub profile_changed: bool,
}

/// CRM contact operations consumed by the pipeline
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// `Ok(None)` means definitively not found; CRM unavailability is
    /// an `Error::Lookup` and must not be treated as not-found
    async fn lookup_by_email(&self, email: &NormalizedEmail) -> Result<Option<StoredContact>>;

    async fn lookup_by_phone(&self, phone: &NormalizedPhone) -> Result<Option<StoredContact>>;

    /// Idempotent per identity key: a repeated or concurrent create for
    /// the same key reports the existing record instead of duplicating
    async fn create_contact(&self, contact: &Contact) -> Result<CreateOutcome>;

    /// Conditional write: fails with `Error::Conflict` when the stored
    /// attribution version no longer matches `expected_version`
    async fn update_contact(&self, update: &ContactUpdate) -> Result<()>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryCrmState {
    next_id: u64,
    contacts: HashMap<String, Contact>,
    by_phone: HashMap<String, String>,
    by_email: HashMap<String, String>,
}

/// In-memory contact store with native conditional writes
///
/// Reference implementation of the [`ContactStore`] contract and the
/// backend for tests. `set_offline` simulates CRM unavailability.
#[derive(Clone, Default)]
pub struct MemoryCrm {
    state: Arc<Mutex<MemoryCrmState>>,
    offline: Arc<AtomicBool>,
}

impl MemoryCrm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the CRM being unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn contact_count(&self) -> usize {
        self.state.lock().expect("memory crm lock").contacts.len()
    }

    pub fn get(&self, crm_id: &CrmId) -> Option<Contact> {
        self.state
            .lock()
            .expect("memory crm lock")
            .contacts
            .get(&crm_id.0)
            .cloned()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::Lookup("CRM offline (simulated)".to_string()))
        } else {
            Ok(())
        }
    }

    fn existing_id(state: &MemoryCrmState, contact: &Contact) -> Option<String> {
        if let Some(phone) = &contact.identity.phone {
            if let Some(id) = state.by_phone.get(phone.key()) {
                return Some(id.clone());
            }
        }
        if let Some(email) = &contact.identity.email {
            if let Some(id) = state.by_email.get(email.key()) {
                return Some(id.clone());
            }
        }
        None
    }

    fn index(state: &mut MemoryCrmState, id: &str, contact: &Contact) {
        if let Some(phone) = &contact.identity.phone {
            state.by_phone.insert(phone.key().to_string(), id.to_string());
        }
        if let Some(email) = &contact.identity.email {
            state.by_email.insert(email.key().to_string(), id.to_string());
        }
    }
}

#[async_trait]
impl ContactStore for MemoryCrm {
    async fn lookup_by_email(&self, email: &NormalizedEmail) -> Result<Option<StoredContact>> {
        self.check_online()?;
        let state = self.state.lock().expect("memory crm lock");
        Ok(state.by_email.get(email.key()).and_then(|id| {
            state.contacts.get(id).map(|contact| StoredContact {
                crm_id: CrmId(id.clone()),
                contact: contact.clone(),
            })
        }))
    }

    async fn lookup_by_phone(&self, phone: &NormalizedPhone) -> Result<Option<StoredContact>> {
        self.check_online()?;
        let state = self.state.lock().expect("memory crm lock");
        Ok(state.by_phone.get(phone.key()).and_then(|id| {
            state.contacts.get(id).map(|contact| StoredContact {
                crm_id: CrmId(id.clone()),
                contact: contact.clone(),
            })
        }))
    }

    async fn create_contact(&self, contact: &Contact) -> Result<CreateOutcome> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::sync_retryable("CRM offline (simulated)"));
        }
        let mut state = self.state.lock().expect("memory crm lock");

        if let Some(id) = Self::existing_id(&state, contact) {
            let existing = state.contacts.get(&id).cloned().ok_or_else(|| {
                Error::Internal(format!("dangling identity index for crm id {}", id))
            })?;
            return Ok(CreateOutcome::AlreadyExists(StoredContact {
                crm_id: CrmId(id),
                contact: existing,
            }));
        }

        state.next_id += 1;
        let id = state.next_id.to_string();
        let mut stored = contact.clone();
        stored.crm_id = Some(CrmId(id.clone()));
        Self::index(&mut state, &id, &stored);
        state.contacts.insert(id.clone(), stored);
        Ok(CreateOutcome::Created(CrmId(id)))
    }

    async fn update_contact(&self, update: &ContactUpdate) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::sync_retryable("CRM offline (simulated)"));
        }
        let mut state = self.state.lock().expect("memory crm lock");

        let current = state.contacts.get(&update.crm_id.0).ok_or_else(|| {
            Error::sync_fatal(format!("Unknown CRM id: {}", update.crm_id))
        })?;

        if current.attribution.version != update.expected_version {
            return Err(Error::Conflict(format!(
                "Version moved from {} to {} for CRM id {}",
                update.expected_version, current.attribution.version, update.crm_id
            )));
        }

        let mut stored = update.contact.clone();
        stored.crm_id = Some(update.crm_id.clone());
        Self::index(&mut state, &update.crm_id.0, &stored);
        state.contacts.insert(update.crm_id.0.clone(), stored);
        Ok(())
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Per-identity-key async locks
///
/// The hosted CRM has no conditional writes, so read-modify-write pairs
/// are serialized per identity key. The guard is held only for the
/// read + write of one attempt, never across a retry boundary.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyedLocks {
    pub async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("keyed locks map");
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Contact record shape returned by the CRM REST API
#[derive(Debug, Deserialize)]
struct CrmContactRecord {
    id: serde_json::Value,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
}

/// REST client for the hosted CRM contact API
pub struct HttpCrm {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    country_code: String,
    locks: KeyedLocks,
}

impl HttpCrm {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        country_code: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            country_code: country_code.into(),
            locks: KeyedLocks::default(),
        })
    }

    async fn get_contact(&self, identifier: &str, phone_lookup: bool) -> Result<Option<StoredContact>> {
        let mut url = format!(
            "{}/contacts/{}",
            self.base_url,
            encode_path_segment(identifier)
        );
        if phone_lookup {
            url.push_str("?identifierType=phone_id");
        }

        tracing::debug!(url = %url, "CRM contact lookup");

        let response = self
            .http
            .get(&url)
            .header("api-key", &self.api_key)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::Lookup(format!("CRM unreachable: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Lookup(format!(
                "CRM lookup returned status {}",
                status
            )));
        }

        let record: CrmContactRecord = response
            .json()
            .await
            .map_err(|e| Error::Lookup(format!("CRM response parse failed: {}", e)))?;

        Ok(Some(self.contact_from_record(record)?))
    }

    fn contact_from_record(&self, record: CrmContactRecord) -> Result<StoredContact> {
        let crm_id = CrmId(value_to_string(&record.id));
        let attrs: BTreeMap<String, String> = record
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect();

        let email = record
            .email
            .as_deref()
            .filter(|e| !e.ends_with(PLACEHOLDER_EMAIL_DOMAIN))
            .and_then(|e| NormalizedEmail::parse(e).ok());
        let phone = attrs
            .get("SMS")
            .and_then(|p| NormalizedPhone::parse(p, &self.country_code).ok());
        let identity = IdentityKeys::new(email, phone).map_err(|_| {
            Error::sync_fatal(format!(
                "CRM record {} has no usable identity key",
                crm_id
            ))
        })?;

        let click_id = attrs
            .get("GCLID")
            .filter(|t| !t.is_empty())
            .map(|t| ClickId::Gclid(t.clone()))
            .or_else(|| {
                attrs
                    .get("FBCLID")
                    .filter(|t| !t.is_empty())
                    .map(|t| ClickId::Fbclid(t.clone()))
            });

        let first_touch = touch_from_attrs(&attrs, "FIRST_TOUCH", click_id.clone());
        let last_touch = touch_from_attrs(&attrs, "UTM", None);

        let touch_count = attrs
            .get("TOUCH_COUNT")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);
        let version = attrs
            .get("ATTRIBUTION_VERSION")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1);
        let channels_seen: BTreeSet<Channel> = attrs
            .get("CHANNELS_SEEN")
            .map(|v| v.split(',').filter_map(Channel::parse).collect())
            .unwrap_or_default();

        let attribution = AttributionSnapshot::from_parts(
            first_touch,
            last_touch,
            touch_count,
            channels_seen,
            version,
        );

        let lead_score = attrs.get("LEAD_SCORE").and_then(|v| v.parse::<u8>().ok());
        let quality_tier = lead_score.map(QualityTier::from_score);

        let created_at = attribution.first_touch().captured_at;
        let last_modified_at = attribution.last_touch.captured_at;

        let contact = Contact {
            identity,
            crm_id: Some(crm_id.clone()),
            attribution,
            lead_score,
            quality_tier,
            needs_attribution_update: attrs
                .get("NEEDS_ATTRIBUTION_UPDATE")
                .map(|v| v == "true")
                .unwrap_or(false),
            profile: ContactProfile {
                first_name: attrs.get("FIRSTNAME").cloned().unwrap_or_default(),
                last_name: attrs.get("LASTNAME").cloned().unwrap_or_default(),
                preferred_course: attrs.get("PREFERRED_COURSE").cloned().filter(|v| !v.is_empty()),
                client_id: attrs.get("CLIENT_ID").cloned().filter(|v| !v.is_empty()),
                qualification_summary: attrs
                    .get("CONVERSATION_SUMMARY")
                    .cloned()
                    .filter(|v| !v.is_empty()),
            },
            created_at,
            last_modified_at,
        };

        Ok(StoredContact { crm_id, contact })
    }

    fn record_email(contact: &Contact) -> String {
        if let Some(email) = &contact.identity.email {
            return email.key().to_string();
        }
        // The CRM keys every record by email; phone-only WhatsApp
        // contacts get a synthesized address on a reserved TLD
        let phone = contact
            .identity
            .phone
            .as_ref()
            .map(|p| p.key().to_string())
            .unwrap_or_default();
        format!("whatsapp-{}{}", phone, PLACEHOLDER_EMAIL_DOMAIN)
    }

    fn full_attributes(contact: &Contact) -> BTreeMap<String, String> {
        let mut attrs = contact.profile_attributes();
        attrs.extend(contact.attribution_attributes());
        attrs.extend(contact.score_attributes());
        attrs
    }
}

const PLACEHOLDER_EMAIL_DOMAIN: &str = "@leads.invalid";

#[async_trait]
impl ContactStore for HttpCrm {
    async fn lookup_by_email(&self, email: &NormalizedEmail) -> Result<Option<StoredContact>> {
        self.get_contact(email.key(), false).await
    }

    async fn lookup_by_phone(&self, phone: &NormalizedPhone) -> Result<Option<StoredContact>> {
        self.get_contact(&phone.e164(), true).await
    }

    async fn create_contact(&self, contact: &Contact) -> Result<CreateOutcome> {
        let key = contact.identity.primary_key();
        let _guard = self.locks.acquire(&key).await;

        let body = json!({
            "email": Self::record_email(contact),
            "attributes": Self::full_attributes(contact),
            "updateEnabled": false,
        });

        let url = format!("{}/contacts", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::sync_retryable(format!("CRM create failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let created: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::sync_retryable(format!("CRM create response parse: {}", e)))?;
            let id = value_to_string(&created["id"]);
            tracing::info!(crm_id = %id, identity = %key, "Created CRM contact");
            return Ok(CreateOutcome::Created(CrmId(id)));
        }

        let body_text = response.text().await.unwrap_or_default();
        if status.as_u16() == 400 && body_text.contains("duplicate") {
            // Lost a create race outside our process: surface the winner
            let existing = match &contact.identity.phone {
                Some(phone) => self.lookup_by_phone(phone).await?,
                None => None,
            };
            let existing = match (existing, &contact.identity.email) {
                (Some(found), _) => Some(found),
                (None, Some(email)) => self.lookup_by_email(email).await?,
                (None, None) => None,
            };
            if let Some(found) = existing {
                return Ok(CreateOutcome::AlreadyExists(found));
            }
            return Err(Error::sync_retryable(
                "CRM reported duplicate but contact not found on re-lookup",
            ));
        }

        if status.is_server_error() {
            Err(Error::sync_retryable(format!(
                "CRM create returned status {}: {}",
                status, body_text
            )))
        } else {
            Err(Error::sync_fatal(format!(
                "CRM create rejected ({}): {}",
                status, body_text
            )))
        }
    }

    async fn update_contact(&self, update: &ContactUpdate) -> Result<()> {
        let key = update.contact.identity.primary_key();
        let _guard = self.locks.acquire(&key).await;

        // No native conditional write: re-read the version under the
        // key lock and reject the update if another writer moved it
        let current = self
            .get_contact(&update.crm_id.0, false)
            .await
            .map_err(|e| Error::sync_retryable(format!("CRM pre-update read failed: {}", e)))?
            .ok_or_else(|| Error::sync_fatal(format!("Unknown CRM id: {}", update.crm_id)))?;

        if current.contact.attribution.version != update.expected_version {
            return Err(Error::Conflict(format!(
                "Version moved from {} to {} for CRM id {}",
                update.expected_version, current.contact.attribution.version, update.crm_id
            )));
        }

        let mut attrs = update.contact.attribution_attributes();
        if update.profile_changed {
            attrs.extend(update.contact.profile_attributes());
        }
        if update.score_changed {
            attrs.extend(update.contact.score_attributes());
        }

        let url = format!(
            "{}/contacts/{}",
            self.base_url,
            encode_path_segment(&update.crm_id.0)
        );
        let response = self
            .http
            .put(&url)
            .header("api-key", &self.api_key)
            .json(&json!({ "attributes": attrs }))
            .send()
            .await
            .map_err(|e| Error::sync_retryable(format!("CRM update failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body_text = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(Error::sync_retryable(format!(
                "CRM update returned status {}: {}",
                status, body_text
            )))
        } else {
            Err(Error::sync_fatal(format!(
                "CRM update rejected ({}): {}",
                status, body_text
            )))
        }
    }
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn touch_from_attrs(
    attrs: &BTreeMap<String, String>,
    prefix: &str,
    click_id: Option<ClickId>,
) -> Touchpoint {
    let get = |suffix: &str| -> Option<String> {
        attrs
            .get(&format!("{}_{}", prefix, suffix))
            .cloned()
            .filter(|v| !v.is_empty())
    };
    let channel_key = if prefix == "UTM" {
        "LAST_TOUCH_CHANNEL"
    } else {
        "FIRST_TOUCH_CHANNEL"
    };
    let timestamp_key = if prefix == "UTM" {
        "LAST_TOUCH_TIMESTAMP"
    } else {
        "FIRST_TOUCH_TIMESTAMP"
    };

    Touchpoint {
        source: get("SOURCE").unwrap_or_else(|| "direct".to_string()),
        medium: get("MEDIUM").unwrap_or_else(|| "none".to_string()),
        campaign: get("CAMPAIGN"),
        term: get("TERM"),
        content: get("CONTENT"),
        click_id,
        channel: attrs
            .get(channel_key)
            .and_then(|v| Channel::parse(v))
            .unwrap_or(Channel::Direct),
        captured_at: attrs
            .get(timestamp_key)
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now),
        raw_params: BTreeMap::new(),
    }
}

/// Percent-encode a path segment (emails and E.164 numbers carry
/// characters the CRM API requires encoded)
fn encode_path_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
