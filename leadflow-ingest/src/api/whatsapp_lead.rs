//! WhatsApp lead webhook
//!
//! POST /api/leads/whatsapp
//!
//! Receives leads from the WhatsApp messaging integration. The message
//! itself is the last touch (whatsapp/messaging); when the browser
//! capture client attached its persisted first-touch store, that
//! earlier anonymous visit seeds the contact's first touch. The
//! upstream messaging platform treats slow responses as delivery
//! failures, so this handler always answers fast: if the CRM cannot be
//! reached inline, the lead is acknowledged and the sync is deferred.

use axum::{extract::State, routing::post, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    Channel, ContactProfile, ConversionEventType, IdentityKeys, NormalizedEmail, NormalizedPhone,
};
use crate::services::merge_engine::MergeRequest;
use crate::services::normalizer;
use crate::services::pipeline::{record_conversion_best_effort, IngestOutcome};
use crate::AppState;

/// POST /api/leads/whatsapp request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsappLeadRequest {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub phone: String,
    pub course_name: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Attribution bag attached by the browser capture client:
    /// `first_touch_*` keys, click ids, `client_id`, `referrer`
    #[serde(default)]
    pub attribution: BTreeMap<String, String>,
}

/// POST /api/leads/whatsapp response
#[derive(Debug, Serialize)]
pub struct WhatsappLeadResponse {
    pub success: bool,
    pub is_new: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    /// CRM sync was queued for deferred reconciliation
    pub deferred: bool,
    pub duplicate: bool,
    pub message: String,
}

/// POST /api/leads/whatsapp
pub async fn push_whatsapp_lead(
    State(state): State<AppState>,
    Json(request): Json<WhatsappLeadRequest>,
) -> ApiResult<Json<WhatsappLeadResponse>> {
    if request.first_name.trim().is_empty()
        || request.last_name.trim().is_empty()
        || request.course_name.trim().is_empty()
    {
        return Err(ApiError::BadRequest(
            "Missing required fields: firstName, lastName, phone, courseName".to_string(),
        ));
    }

    // Phone is required and must normalize; a message without a valid
    // sender number is unusable as an identity
    let phone = NormalizedPhone::parse(&request.phone, &state.config.default_country_code)
        .map_err(ApiError::from)?;
    let email = match &request.email {
        Some(raw) if !raw.trim().is_empty() => Some(NormalizedEmail::parse(raw)?),
        _ => None,
    };
    let identity = IdentityKeys::new(email, Some(phone))?;

    let captured_at =
        normalizer::payload_timestamp(&request.attribution).unwrap_or_else(Utc::now);

    // The WhatsApp message is the attribution signal for the last touch
    let mut params = BTreeMap::new();
    params.insert("utm_source".to_string(), "whatsapp".to_string());
    params.insert("utm_medium".to_string(), "messaging".to_string());
    params.insert("utm_campaign".to_string(), "whatsapp-organic".to_string());
    params.insert("referrer".to_string(), "WhatsApp Business".to_string());
    if let Some(message) = &request.message {
        params.insert("message".to_string(), message.clone());
    }
    let touchpoint = normalizer::normalize(&params, Channel::Messaging, captured_at)?;

    let recovered_first_touch = normalizer::recovered_first_touch(&request.attribution);

    let profile = ContactProfile {
        first_name: request.first_name.trim().to_string(),
        last_name: request.last_name.trim().to_string(),
        preferred_course: Some(request.course_name.trim().to_string()),
        client_id: request
            .attribution
            .get("client_id")
            .cloned()
            .filter(|v| !v.is_empty()),
        qualification_summary: None,
    };

    let merge_request = MergeRequest {
        identity,
        profile,
        touchpoint,
        recovered_first_touch,
        score: None,
    };

    let outcome = state.pipeline.ingest(merge_request.clone()).await?;

    if !matches!(outcome, IngestOutcome::Duplicate) {
        record_conversion_best_effort(
            &state.pipeline,
            &merge_request,
            &outcome,
            ConversionEventType::WhatsappLead,
        )
        .await;
    }

    let response = match outcome {
        IngestOutcome::Completed(merge) => WhatsappLeadResponse {
            success: true,
            is_new: merge.is_new(),
            contact_id: Some(merge.crm_id().to_string()),
            deferred: false,
            duplicate: false,
            message: if merge.is_new() {
                "New WhatsApp contact created".to_string()
            } else {
                "Existing contact updated with WhatsApp as last touch".to_string()
            },
        },
        IngestOutcome::Deferred { reason } => WhatsappLeadResponse {
            success: true,
            is_new: false,
            contact_id: None,
            deferred: true,
            duplicate: false,
            message: format!("Lead accepted; CRM sync deferred ({})", reason),
        },
        IngestOutcome::Duplicate => WhatsappLeadResponse {
            success: true,
            is_new: false,
            contact_id: None,
            deferred: false,
            duplicate: true,
            message: "Duplicate delivery ignored".to_string(),
        },
    };

    Ok(Json(response))
}

/// Build WhatsApp webhook routes
pub fn whatsapp_routes() -> Router<AppState> {
    Router::new().route("/api/leads/whatsapp", post(push_whatsapp_lead))
}
