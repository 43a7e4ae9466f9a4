//! Data model for the lead ingest pipeline

pub mod contact;
pub mod conversion;
pub mod lead_score;
pub mod touchpoint;

pub use contact::{Contact, ContactProfile, CrmId, IdentityKeys, NormalizedEmail, NormalizedPhone};
pub use conversion::{AdConversionPayload, ConversionEvent, ConversionEventType};
pub use lead_score::{LeadScore, QualificationAnswers, QualityTier};
pub use touchpoint::{AttributionSnapshot, Channel, ClickId, Touchpoint};
