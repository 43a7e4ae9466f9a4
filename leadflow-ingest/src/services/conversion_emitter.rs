//! Conversion Event Emitter
//!
//! Appends the conversion to the local append-only log, then forwards
//! it to each configured ad platform for bid optimization. Delivery is
//! best effort: a platform failure is logged and never rolls back
//! contact or CRM state. Conversion reporting is downstream
//! telemetry, not a source of truth.

use leadflow_common::config::AdPlatformConfig;
use leadflow_common::events::{EventBus, LeadEvent};
use leadflow_common::{Error, Result};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db;
use crate::models::{AdConversionPayload, ConversionEvent};

pub struct ConversionEmitter {
    http: reqwest::Client,
    platforms: Vec<AdPlatformConfig>,
    db: SqlitePool,
    event_bus: EventBus,
}

impl ConversionEmitter {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        platforms: Vec<AdPlatformConfig>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            http,
            platforms,
            db,
            event_bus,
        })
    }

    /// Record the event, then deliver to every configured platform
    ///
    /// The log append is the only fallible step; platform delivery
    /// failures are logged and swallowed.
    pub async fn record_and_emit(&self, event: ConversionEvent) -> Result<()> {
        db::conversions::append(&self.db, &event).await?;

        self.event_bus.publish(LeadEvent::ConversionRecorded {
            event_id: event.event_id,
            identity_key: event.contact_ref.clone(),
            value_usd: event.value_usd,
            event_type: event.event_type.as_str().to_string(),
            timestamp: event.occurred_at,
        });

        let Some(payload) = AdConversionPayload::for_event(&event) else {
            // Without a click id no platform can match the conversion
            debug!(
                contact = %event.contact_ref,
                "Conversion recorded without click id, skipping platform delivery"
            );
            return Ok(());
        };

        for platform in &self.platforms {
            match self.http.post(&platform.url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        platform = %platform.name,
                        value = payload.value,
                        "Conversion delivered"
                    );
                }
                Ok(response) => {
                    warn!(
                        platform = %platform.name,
                        status = %response.status(),
                        "Ad platform rejected conversion"
                    );
                }
                Err(err) => {
                    warn!(
                        platform = %platform.name,
                        error = %err,
                        "Ad platform delivery failed"
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClickId, ConversionEventType};
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_logged_even_when_no_platforms_configured() {
        let pool = crate::db::test_pool().await;
        let emitter =
            ConversionEmitter::new(pool.clone(), EventBus::new(8), Vec::new(), 5).unwrap();

        let event = ConversionEvent::new(
            "254711486581".to_string(),
            100,
            ConversionEventType::EnquiryForm,
            Some(ClickId::Gclid("abc123".to_string())),
            Utc::now(),
        );
        emitter.record_and_emit(event).await.unwrap();

        let logged = db::conversions::for_contact(&pool, "254711486581")
            .await
            .unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].value_usd, 100);
    }

    #[tokio::test]
    async fn test_platform_failure_does_not_fail_the_event() {
        let pool = crate::db::test_pool().await;
        // Unroutable platform endpoint
        let platforms = vec![AdPlatformConfig {
            name: "google-ads".to_string(),
            url: "http://127.0.0.1:1/conversions".to_string(),
        }];
        let emitter = ConversionEmitter::new(pool.clone(), EventBus::new(8), platforms, 1).unwrap();

        let event = ConversionEvent::new(
            "254711486581".to_string(),
            30,
            ConversionEventType::WhatsappLead,
            Some(ClickId::Fbclid("fb".to_string())),
            Utc::now(),
        );
        emitter.record_and_emit(event).await.unwrap();

        let logged = db::conversions::for_contact(&pool, "254711486581")
            .await
            .unwrap();
        assert_eq!(logged.len(), 1);
    }
}
