//! API endpoints for leadflow-ingest

pub mod enquiry;
pub mod health;
pub mod whatsapp_lead;

pub use enquiry::enquiry_routes;
pub use health::health_routes;
pub use whatsapp_lead::whatsapp_routes;
