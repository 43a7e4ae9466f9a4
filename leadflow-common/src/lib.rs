//! Shared types and plumbing for Leadflow services
//!
//! Provides the common error taxonomy, configuration resolution, and the
//! broadcast event bus used across the Leadflow workspace.

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
