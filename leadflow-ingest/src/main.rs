//! leadflow-ingest - Lead Ingest Microservice
//!
//! Receives marketing leads (WhatsApp webhook, enquiry form), resolves
//! identity against the CRM, merges multi-touch attribution under the
//! first-touch-immutable rule, scores qualifying enquiries, and syncs
//! the result to the CRM exactly once per logical change.

use anyhow::Result;
use leadflow_common::config::LeadflowConfig;
use leadflow_common::events::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use leadflow_ingest::services::crm_client::{ContactStore, HttpCrm};
use leadflow_ingest::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting leadflow-ingest (Lead Ingest) microservice");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Configuration is fatal when incomplete: running without CRM
    // credentials would silently drop leads
    let config = Arc::new(LeadflowConfig::load()?);
    info!("CRM endpoint: {}", config.crm_base_url);

    let db_pool = leadflow_ingest::db::init_database_pool(&config.database_path).await?;
    info!("Work-state database: {}", config.database_path.display());

    let event_bus = EventBus::new(100);

    let store: Arc<dyn ContactStore> = Arc::new(HttpCrm::new(
        config.crm_base_url.clone(),
        config.crm_api_key.clone(),
        config.default_country_code.clone(),
        config.crm_timeout_secs,
    )?);

    let state = AppState::new(db_pool, event_bus, config.clone(), store)?;

    // Background sweep over the deferred-reconciliation queue
    let reconciler = Arc::new(state.reconciler());
    reconciler.spawn(Duration::from_secs(config.sweep_interval_secs));
    info!(
        "Reconciliation sweep every {}s",
        config.sweep_interval_secs
    );

    let app = leadflow_ingest::build_router(state);

    let addr = format!("127.0.0.1:{}", config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
