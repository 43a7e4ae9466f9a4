//! Event types for the Leadflow event system
//!
//! Provides the shared event definitions and `EventBus` used by the
//! ingest pipeline. Events are broadcast in-process; subscribers include
//! the conversion emitter and any diagnostics listener.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Leadflow pipeline events
///
/// All stages publish through this central enum for type safety and
/// exhaustive matching. Every variant carries the identity key of the
/// affected contact so subscribers can correlate a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LeadEvent {
    /// An inbound lead passed validation and was acknowledged
    LeadAccepted {
        /// Unit-of-work id assigned at ingestion
        unit_id: Uuid,
        identity_key: String,
        channel: String,
        timestamp: DateTime<Utc>,
    },

    /// A new contact was created in the CRM
    ContactCreated {
        identity_key: String,
        crm_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An existing contact absorbed a new touchpoint
    ContactUpdated {
        identity_key: String,
        crm_id: String,
        touch_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// CRM sync could not complete inline and was queued for
    /// deferred reconciliation
    SyncDeferred {
        identity_key: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A conversion event was recorded and dispatched to ad platforms
    ConversionRecorded {
        event_id: Uuid,
        identity_key: String,
        value_usd: u32,
        event_type: String,
        timestamp: DateTime<Utc>,
    },
}

impl LeadEvent {
    /// Identity key of the contact this event concerns
    pub fn identity_key(&self) -> &str {
        match self {
            LeadEvent::LeadAccepted { identity_key, .. }
            | LeadEvent::ContactCreated { identity_key, .. }
            | LeadEvent::ContactUpdated { identity_key, .. }
            | LeadEvent::SyncDeferred { identity_key, .. }
            | LeadEvent::ConversionRecorded { identity_key, .. } => identity_key,
        }
    }
}

/// Broadcast bus for [`LeadEvent`]
///
/// Thin wrapper over `tokio::sync::broadcast`. Publishing never fails:
/// an event with no subscribers is dropped silently.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LeadEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<LeadEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers
    pub fn publish(&self, event: LeadEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(LeadEvent::LeadAccepted {
            unit_id: Uuid::new_v4(),
            identity_key: "254711486581".to_string(),
            channel: "messaging".to_string(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.identity_key(), "254711486581");
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        bus.publish(LeadEvent::SyncDeferred {
            identity_key: "a@b.com".to_string(),
            reason: "circuit open".to_string(),
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn test_event_serialization_tags_type() {
        let event = LeadEvent::ContactCreated {
            identity_key: "254711486581".to_string(),
            crm_id: "42".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ContactCreated");
    }
}
