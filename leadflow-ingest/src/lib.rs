//! leadflow-ingest library interface
//!
//! Exposes the pipeline services and router for integration testing.

pub mod api;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use leadflow_common::config::LeadflowConfig;
use leadflow_common::events::EventBus;
use leadflow_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::services::conversion_emitter::ConversionEmitter;
use crate::services::crm_client::ContactStore;
use crate::services::crm_sync::{RetryPolicy, SyncAdapter};
use crate::services::merge_engine::MergeEngine;
use crate::services::pipeline::LeadPipeline;
use crate::services::reconciler::Reconciler;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub config: Arc<LeadflowConfig>,
    pub pipeline: Arc<LeadPipeline>,
    sync: Arc<SyncAdapter>,
    store: Arc<dyn ContactStore>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Wire the pipeline over a contact store
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        config: Arc<LeadflowConfig>,
        store: Arc<dyn ContactStore>,
    ) -> Result<Self> {
        let policy = RetryPolicy {
            max_attempts: config.max_sync_attempts,
            base_ms: config.retry_base_ms,
            factor: 2.0,
            cap_ms: 8_000,
        };
        let sync = Arc::new(SyncAdapter::new(
            store.clone(),
            policy.clone(),
            config.breaker_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        ));
        let merge = Arc::new(MergeEngine::new(sync.clone(), config.merge_max_retries));
        let emitter = Arc::new(ConversionEmitter::new(
            db.clone(),
            event_bus.clone(),
            config.ad_platforms.clone(),
            config.crm_timeout_secs,
        )?);

        let pipeline = Arc::new(LeadPipeline {
            db: db.clone(),
            store: store.clone(),
            merge,
            emitter,
            event_bus: event_bus.clone(),
            lookup_policy: policy,
        });

        Ok(Self {
            db,
            event_bus,
            config,
            pipeline,
            sync,
            store,
            startup_time: Utc::now(),
        })
    }

    /// Whether the CRM circuit breaker is currently open
    pub fn circuit_open(&self) -> bool {
        self.sync.circuit_open()
    }

    /// Build the deferred-reconciliation sweeper for this state
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.db.clone(),
            self.store.clone(),
            self.pipeline.merge.clone(),
            RetryPolicy {
                max_attempts: self.config.max_sync_attempts,
                base_ms: self.config.retry_base_ms.max(1_000),
                factor: 2.0,
                cap_ms: 300_000,
            },
            self.config.max_sync_attempts * 2,
        )
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::whatsapp_routes())
        .merge(api::enquiry_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
