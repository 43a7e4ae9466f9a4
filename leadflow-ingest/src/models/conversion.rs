//! Conversion event records
//!
//! Conversion events are append-only: re-scoring a contact produces a
//! new event, it never alters history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::touchpoint::ClickId;

/// Qualifying action that produced a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionEventType {
    EnquiryForm,
    WhatsappLead,
}

impl ConversionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionEventType::EnquiryForm => "enquiry_form",
            ConversionEventType::WhatsappLead => "whatsapp_lead",
        }
    }

    pub fn parse(raw: &str) -> Option<ConversionEventType> {
        match raw {
            "enquiry_form" => Some(ConversionEventType::EnquiryForm),
            "whatsapp_lead" => Some(ConversionEventType::WhatsappLead),
            _ => None,
        }
    }
}

/// Immutable record of one conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub event_id: Uuid,
    /// Normalized identity key of the contact
    pub contact_ref: String,
    /// Tier dollar value at the time of the event
    pub value_usd: u32,
    pub event_type: ConversionEventType,
    /// Click id used for ad-platform matching, when the contact has one
    pub click_id: Option<ClickId>,
    pub occurred_at: DateTime<Utc>,
}

impl ConversionEvent {
    pub fn new(
        contact_ref: String,
        value_usd: u32,
        event_type: ConversionEventType,
        click_id: Option<ClickId>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            contact_ref,
            value_usd,
            event_type,
            click_id,
            occurred_at,
        }
    }
}

/// Wire payload posted to an ad platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdConversionPayload {
    pub click_id: String,
    pub value: u32,
    pub currency: String,
    pub event_type: String,
}

impl AdConversionPayload {
    /// Build the platform payload for an event with a click id
    pub fn for_event(event: &ConversionEvent) -> Option<AdConversionPayload> {
        let click_id = event.click_id.as_ref()?;
        Some(AdConversionPayload {
            click_id: click_id.token().to_string(),
            value: event.value_usd,
            currency: "USD".to_string(),
            event_type: event.event_type.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_requires_click_id() {
        let event = ConversionEvent::new(
            "254711486581".to_string(),
            100,
            ConversionEventType::EnquiryForm,
            None,
            Utc::now(),
        );
        assert!(AdConversionPayload::for_event(&event).is_none());

        let event = ConversionEvent {
            click_id: Some(ClickId::Gclid("abc123".to_string())),
            ..event
        };
        let payload = AdConversionPayload::for_event(&event).unwrap();
        assert_eq!(payload.click_id, "abc123");
        assert_eq!(payload.value, 100);
        assert_eq!(payload.currency, "USD");
        assert_eq!(payload.event_type, "enquiry_form");
    }
}
