//! Integration tests for the leadflow-ingest API endpoints
//!
//! Tests cover the end-to-end pipeline properties over the router and
//! the in-memory CRM:
//! - idempotence under duplicate webhook delivery
//! - first-touch immutability across channels
//! - phone normalization equivalence
//! - no duplicate contact creation for one identity
//! - defer-and-reconcile when the CRM is unreachable
//! - the scored enquiry flow (score, tier, conversion value)

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use leadflow_common::config::LeadflowConfig;
use leadflow_common::events::EventBus;
use leadflow_ingest::models::NormalizedPhone;
use leadflow_ingest::services::crm_client::{ContactStore, MemoryCrm};
use leadflow_ingest::{build_router, AppState};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tower::util::ServiceExt; // for `oneshot` method

struct TestEnv {
    app: axum::Router,
    state: AppState,
    crm: MemoryCrm,
    _tmp: tempfile::TempDir,
}

fn test_config() -> LeadflowConfig {
    LeadflowConfig {
        listen_port: 0,
        crm_base_url: "http://crm.test".to_string(),
        crm_api_key: "test-key".to_string(),
        default_country_code: "254".to_string(),
        database_path: PathBuf::new(),
        crm_timeout_secs: 2,
        // Fast retries so unreachable-CRM tests finish quickly
        max_sync_attempts: 2,
        retry_base_ms: 1,
        breaker_threshold: 100,
        breaker_cooldown_secs: 60,
        merge_max_retries: 3,
        sweep_interval_secs: 60,
        ad_platforms: Vec::new(),
    }
}

async fn setup() -> TestEnv {
    let tmp = tempfile::tempdir().expect("temp dir");
    let db = leadflow_ingest::db::init_database_pool(&tmp.path().join("leadflow.db"))
        .await
        .expect("db init");

    let crm = MemoryCrm::new();
    let store: Arc<dyn ContactStore> = Arc::new(crm.clone());
    let state = AppState::new(db, EventBus::new(64), Arc::new(test_config()), store)
        .expect("app state");
    let app = build_router(state.clone());

    TestEnv {
        app,
        state,
        crm,
        _tmp: tmp,
    }
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

fn whatsapp_body(phone: &str, timestamp: &str) -> Value {
    json!({
        "firstName": "John",
        "lastName": "Doe",
        "phone": phone,
        "courseName": "Music Production Diploma",
        "message": "I'm interested in learning music production",
        "attribution": { "timestamp": timestamp }
    })
}

fn hot_enquiry_body(phone: &str, email: &str, attribution: Value) -> Value {
    // 4 + 4 + 4 + 4 + 1 = 17 -> Hot
    json!({
        "firstName": "Jane",
        "lastName": "Wanjiku",
        "email": email,
        "phone": phone,
        "courseName": "Film Production Diploma",
        "studyTimeline": "january-2026",
        "programType": "full-time-diploma",
        "investmentRange": "500k-plus",
        "careerGoals": "career-change",
        "experienceLevel": "some-experience",
        "attribution": attribution
    })
}

// =============================================================================
// Health endpoint
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let env = setup().await;
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = env.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "leadflow-ingest");
    assert_eq!(body["crm_circuit_open"], false);
}

// =============================================================================
// WhatsApp webhook
// =============================================================================

#[tokio::test]
async fn test_whatsapp_lead_creates_contact() {
    let env = setup().await;
    let response = env
        .app
        .oneshot(post_json(
            "/api/leads/whatsapp",
            &whatsapp_body("0711486581", "2026-08-06T09:00:00+00:00"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["is_new"], true);
    assert_eq!(body["deferred"], false);

    assert_eq!(env.crm.contact_count(), 1);
    let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
    let stored = env.crm.lookup_by_phone(&phone).await.unwrap().unwrap();
    assert_eq!(stored.contact.attribution.first_touch().source, "whatsapp");
    assert_eq!(stored.contact.attribution.last_touch.medium, "messaging");
    assert_eq!(stored.contact.attribution.touch_count, 1);
    // No click id, no client id: flagged for backfill
    assert!(stored.contact.needs_attribution_update);
}

#[tokio::test]
async fn test_replaying_identical_payload_is_idempotent() {
    let env = setup().await;
    let body = whatsapp_body("0711486581", "2026-08-06T09:00:00+00:00");

    let first = env
        .app
        .clone()
        .oneshot(post_json("/api/leads/whatsapp", &body))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = env
        .app
        .oneshot(post_json("/api/leads/whatsapp", &body))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second = extract_json(second.into_body()).await;
    assert_eq!(second["duplicate"], true);

    // One contact, touch_count incremented exactly once
    assert_eq!(env.crm.contact_count(), 1);
    let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
    let stored = env.crm.lookup_by_phone(&phone).await.unwrap().unwrap();
    assert_eq!(stored.contact.attribution.touch_count, 1);
}

#[tokio::test]
async fn test_invalid_phone_is_rejected() {
    let env = setup().await;
    let response = env
        .app
        .oneshot(post_json(
            "/api/leads/whatsapp",
            &whatsapp_body("call-me-maybe", "2026-08-06T09:00:00+00:00"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(env.crm.contact_count(), 0);
}

#[tokio::test]
async fn test_phone_normalization_equivalence_single_contact() {
    let env = setup().await;
    let forms = [
        ("0711486581", "2026-08-06T09:00:00+00:00"),
        ("+254711486581", "2026-08-06T10:00:00+00:00"),
        ("254711486581", "2026-08-06T11:00:00+00:00"),
    ];
    for (phone, timestamp) in forms {
        let response = env
            .app
            .clone()
            .oneshot(post_json("/api/leads/whatsapp", &whatsapp_body(phone, timestamp)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(env.crm.contact_count(), 1);
    let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
    let stored = env.crm.lookup_by_phone(&phone).await.unwrap().unwrap();
    assert_eq!(stored.contact.attribution.touch_count, 3);
}

#[tokio::test]
async fn test_concurrent_posts_create_one_contact() {
    let env = setup().await;
    let (a, b) = tokio::join!(
        env.app.clone().oneshot(post_json(
            "/api/leads/whatsapp",
            &whatsapp_body("0711486581", "2026-08-06T09:00:00+00:00"),
        )),
        env.app.clone().oneshot(post_json(
            "/api/leads/whatsapp",
            &whatsapp_body("0711486581", "2026-08-06T09:00:01+00:00"),
        )),
    );
    assert_eq!(a.unwrap().status(), StatusCode::OK);
    assert_eq!(b.unwrap().status(), StatusCode::OK);

    assert_eq!(env.crm.contact_count(), 1);
    let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
    let stored = env.crm.lookup_by_phone(&phone).await.unwrap().unwrap();
    assert_eq!(stored.contact.attribution.touch_count, 2);
}

// =============================================================================
// Enquiry form
// =============================================================================

#[tokio::test]
async fn test_enquiry_scores_and_returns_conversion_value() {
    let env = setup().await;
    let response = env
        .app
        .oneshot(post_json(
            "/api/leads/enquiry",
            &hot_enquiry_body(
                "0711486581",
                "jane@example.com",
                json!({
                    "utm_source": "google",
                    "utm_medium": "cpc",
                    "gclid": "abc123",
                    "timestamp": "2026-08-06T09:00:00+00:00"
                }),
            ),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["lead_score"], 17);
    assert_eq!(body["quality_tier"], "Hot Lead");
    assert_eq!(body["conversion_value"], 100);
    assert_eq!(body["is_new"], true);

    // Conversion event appended with the tier value, never the raw score
    let events = leadflow_ingest::db::conversions::for_contact(&env.state.db, "254711486581")
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].value_usd, 100);
}

#[tokio::test]
async fn test_unrecognized_answer_is_rejected_not_zeroed() {
    let env = setup().await;
    let mut body = hot_enquiry_body(
        "0711486581",
        "jane@example.com",
        json!({"utm_source": "google", "utm_medium": "cpc"}),
    );
    body["studyTimeline"] = json!("next-century");

    let response = env
        .app
        .oneshot(post_json("/api/leads/enquiry", &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(env.crm.contact_count(), 0);
}

#[tokio::test]
async fn test_first_touch_immutable_across_channels() {
    let env = setup().await;

    // Paid-search enquiry first
    let response = env
        .app
        .clone()
        .oneshot(post_json(
            "/api/leads/enquiry",
            &hot_enquiry_body(
                "0711486581",
                "jane@example.com",
                json!({
                    "utm_source": "google",
                    "utm_medium": "cpc",
                    "gclid": "abc123",
                    "timestamp": "2026-08-03T09:00:00+00:00"
                }),
            ),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // WhatsApp message three days later
    let response = env
        .app
        .oneshot(post_json(
            "/api/leads/whatsapp",
            &whatsapp_body("0711486581", "2026-08-06T09:00:00+00:00"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["is_new"], false);

    let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
    let stored = env.crm.lookup_by_phone(&phone).await.unwrap().unwrap();
    assert_eq!(stored.contact.attribution.first_touch().source, "google");
    assert_eq!(stored.contact.attribution.last_touch.source, "whatsapp");
    assert_eq!(stored.contact.attribution.touch_count, 2);

    // The original ad click stays available for conversion matching
    let attrs = stored.contact.attribution_attributes();
    assert_eq!(attrs["GCLID"], "abc123");
    assert_eq!(attrs["FIRST_TOUCH_SOURCE"], "google");
    assert_eq!(attrs["UTM_SOURCE"], "whatsapp");
}

// =============================================================================
// Deferred reconciliation
// =============================================================================

#[tokio::test]
async fn test_unreachable_crm_defers_then_reconciles() {
    let env = setup().await;
    env.crm.set_offline(true);

    let response = env
        .app
        .oneshot(post_json(
            "/api/leads/whatsapp",
            &whatsapp_body("0711486581", "2026-08-06T09:00:00+00:00"),
        ))
        .await
        .unwrap();

    // Lead still accepted fast, sync parked
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["deferred"], true);
    assert_eq!(env.crm.contact_count(), 0);

    // CRM comes back; the sweep replays the parked unit
    env.crm.set_offline(false);
    let reconciler = env.state.reconciler();
    let processed = reconciler.sweep_once().await.unwrap();
    assert_eq!(processed, 1);
    assert_eq!(env.crm.contact_count(), 1);

    let phone = NormalizedPhone::parse("0711486581", "254").unwrap();
    let stored = env.crm.lookup_by_phone(&phone).await.unwrap().unwrap();
    assert_eq!(stored.contact.attribution.first_touch().source, "whatsapp");
}

// =============================================================================
// End-to-end scenario
// =============================================================================

#[tokio::test]
async fn test_end_to_end_anonymous_click_then_whatsapp_then_enquiry() {
    let env = setup().await;

    // Visitor arrives via paid search and browses: no identity, no
    // contact. Three days later they send a WhatsApp message with no
    // captured click id.
    let response = env
        .app
        .clone()
        .oneshot(post_json(
            "/api/leads/whatsapp",
            &whatsapp_body("0711999888", "2026-08-06T09:00:00+00:00"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let phone = NormalizedPhone::parse("0711999888", "254").unwrap();
    let stored = env.crm.lookup_by_phone(&phone).await.unwrap().unwrap();
    // No prior identity-linked touchpoint existed: first touch is the
    // message itself, and the attribution gap is flagged for backfill
    assert_eq!(stored.contact.attribution.first_touch().source, "whatsapp");
    assert!(stored.contact.stored_click_id().is_none());
    assert!(stored.contact.needs_attribution_update);

    // Their enquiry form scores 17
    let response = env
        .app
        .oneshot(post_json(
            "/api/leads/enquiry",
            &hot_enquiry_body(
                "0711999888",
                "visitor@example.com",
                json!({
                    "utm_source": "direct",
                    "utm_medium": "none",
                    "timestamp": "2026-08-06T10:00:00+00:00"
                }),
            ),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["lead_score"], 17);
    assert_eq!(body["quality_tier"], "Hot Lead");
    assert_eq!(body["conversion_value"], 100);

    let stored = env.crm.lookup_by_phone(&phone).await.unwrap().unwrap();
    assert_eq!(stored.contact.lead_score, Some(17));
    assert_eq!(stored.contact.attribution.first_touch().source, "whatsapp");
    assert_eq!(stored.contact.attribution.touch_count, 2);
    // The gclid never reached any payload, so no GCLID in the CRM
    assert!(!stored.contact.attribution_attributes().contains_key("GCLID"));
}

#[tokio::test]
async fn test_end_to_end_with_browser_persisted_first_touch() {
    let env = setup().await;

    // Same journey, but the capture client attached its persisted
    // first-touch store to the WhatsApp payload
    let mut body = whatsapp_body("0711999888", "2026-08-06T09:00:00+00:00");
    body["attribution"] = json!({
        "timestamp": "2026-08-06T09:00:00+00:00",
        "first_touch_source": "google",
        "first_touch_medium": "cpc",
        "first_touch_campaign": "jan-intake",
        "first_touch_timestamp": "2026-08-03T09:00:00+00:00",
        "gclid": "abc123",
        "client_id": "GA1.2.12345.67890"
    });

    let response = env
        .app
        .oneshot(post_json("/api/leads/whatsapp", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let phone = NormalizedPhone::parse("0711999888", "254").unwrap();
    let stored = env.crm.lookup_by_phone(&phone).await.unwrap().unwrap();

    // The anonymous paid-search visit seeds first touch; the message
    // is the last touch
    assert_eq!(stored.contact.attribution.first_touch().source, "google");
    assert_eq!(stored.contact.attribution.last_touch.source, "whatsapp");
    assert_eq!(stored.contact.attribution.touch_count, 2);
    assert!(!stored.contact.needs_attribution_update);

    let attrs = stored.contact.attribution_attributes();
    assert_eq!(attrs["GCLID"], "abc123");
    assert_eq!(attrs["FIRST_TOUCH_SOURCE"], "google");
    assert_eq!(attrs["FIRST_TOUCH_MEDIUM"], "cpc");
}
