//! Enhanced enquiry form endpoint
//!
//! POST /api/leads/enquiry
//!
//! Receives the qualifying enquiry form: contact fields, the five
//! scoring-dimension answers, and the attribution bag from the browser
//! capture client. The score is always computed server-side; the
//! response carries the score, tier, and conversion value so the
//! caller can fire its client-side ad-platform pixel with the right
//! amount.

use axum::{extract::State, routing::post, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    Channel, ContactProfile, ConversionEventType, IdentityKeys, NormalizedEmail, NormalizedPhone,
    QualificationAnswers,
};
use crate::services::lead_scorer;
use crate::services::merge_engine::MergeRequest;
use crate::services::normalizer;
use crate::services::pipeline::{record_conversion_best_effort, IngestOutcome};
use crate::AppState;

/// POST /api/leads/enquiry request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnquiryRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub course_name: String,
    // The five scoring dimensions
    pub study_timeline: String,
    pub program_type: String,
    pub investment_range: String,
    pub career_goals: String,
    pub experience_level: String,
    /// Attribution bag from the browser capture client (UTMs, click
    /// ids, `first_touch_*`, `client_id`, `referrer`, `landing_page`)
    #[serde(default)]
    pub attribution: BTreeMap<String, String>,
}

/// POST /api/leads/enquiry response
#[derive(Debug, Serialize)]
pub struct EnquiryResponse {
    pub success: bool,
    pub is_new: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    pub deferred: bool,
    pub duplicate: bool,
    pub lead_score: u8,
    pub quality_tier: String,
    /// Tier dollar value for the client-side conversion pixel
    pub conversion_value: u32,
    pub qualification_summary: String,
}

/// POST /api/leads/enquiry
pub async fn push_enquiry(
    State(state): State<AppState>,
    Json(request): Json<EnquiryRequest>,
) -> ApiResult<Json<EnquiryResponse>> {
    if request.first_name.trim().is_empty()
        || request.last_name.trim().is_empty()
        || request.course_name.trim().is_empty()
    {
        return Err(ApiError::BadRequest(
            "Missing required fields: firstName, lastName, email, phone, courseName".to_string(),
        ));
    }

    let email = NormalizedEmail::parse(&request.email)?;
    let phone = NormalizedPhone::parse(&request.phone, &state.config.default_country_code)?;
    let identity = IdentityKeys::new(Some(email), Some(phone))?;

    // Score before anything touches the CRM: an unrecognized answer
    // rejects the submission outright
    let answers = QualificationAnswers {
        study_timeline: request.study_timeline.clone(),
        program_type: request.program_type.clone(),
        budget_range: request.investment_range.clone(),
        career_goal: request.career_goals.clone(),
        experience_level: request.experience_level.clone(),
    };
    let score = lead_scorer::score(&answers)?;
    let summary = lead_scorer::conversation_summary(&answers)?;

    let captured_at =
        normalizer::payload_timestamp(&request.attribution).unwrap_or_else(Utc::now);
    let touchpoint = normalizer::normalize(&request.attribution, Channel::Direct, captured_at)?;
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
        qualification_summary: Some(summary.clone()),
    };

    let merge_request = MergeRequest {
        identity,
        profile,
        touchpoint,
        recovered_first_touch,
        score: Some(score),
    };

    let outcome = state.pipeline.ingest(merge_request.clone()).await?;

    if !matches!(outcome, IngestOutcome::Duplicate) {
        record_conversion_best_effort(
            &state.pipeline,
            &merge_request,
            &outcome,
            ConversionEventType::EnquiryForm,
        )
        .await;
    }

    let (is_new, contact_id, deferred, duplicate) = match &outcome {
        IngestOutcome::Completed(merge) => (
            merge.is_new(),
            Some(merge.crm_id().to_string()),
            false,
            false,
        ),
        IngestOutcome::Deferred { .. } => (false, None, true, false),
        IngestOutcome::Duplicate => (false, None, false, true),
    };

    Ok(Json(EnquiryResponse {
        success: true,
        is_new,
        contact_id,
        deferred,
        duplicate,
        lead_score: score.score,
        quality_tier: score.tier.label().to_string(),
        conversion_value: score.conversion_value_usd,
        qualification_summary: summary,
    }))
}

/// Build enquiry form routes
pub fn enquiry_routes() -> Router<AppState> {
    Router::new().route("/api/leads/enquiry", post(push_enquiry))
}
