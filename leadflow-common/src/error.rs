//! Common error types for Leadflow

use thiserror::Error;

/// Common result type for Leadflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across Leadflow services
///
/// The variants mirror the failure taxonomy of the lead pipeline:
/// validation fails fast, lookups and retryable sync failures are
/// retried with backoff, conflicts are retried a bounded number of
/// times then deferred, configuration problems are fatal.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing input (bad identity, unknown scoring answer).
    /// Fails fast, never retried, surfaced to the caller.
    #[error("Validation error: {0}")]
    Validation(String),

    /// CRM unreachable during identity resolution. Distinct from
    /// "not found": must never be treated as "create new contact".
    #[error("CRM lookup failed: {0}")]
    Lookup(String),

    /// Optimistic-concurrency retries exhausted while merging
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    /// CRM rejected a create/update call
    #[error("CRM sync error: {message} (retryable: {retryable})")]
    Sync {
        /// Timeouts and 5xx are retryable; 4xx payload rejections are not
        retryable: bool,
        message: String,
    },

    /// Missing credentials or endpoint. Fatal: the service halts
    /// rather than silently dropping leads.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient sync failure (network, timeout, 5xx)
    pub fn sync_retryable(message: impl Into<String>) -> Self {
        Error::Sync {
            retryable: true,
            message: message.into(),
        }
    }

    /// Permanent sync failure (malformed payload, 4xx)
    pub fn sync_fatal(message: impl Into<String>) -> Self {
        Error::Sync {
            retryable: false,
            message: message.into(),
        }
    }

    /// Whether the backoff loop may retry this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Lookup(_) | Error::Sync { retryable: true, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::sync_retryable("503").is_retryable());
        assert!(Error::Lookup("timeout".into()).is_retryable());
        assert!(!Error::sync_fatal("bad payload").is_retryable());
        assert!(!Error::Validation("missing phone".into()).is_retryable());
        assert!(!Error::Conflict("version moved".into()).is_retryable());
    }

    #[test]
    fn test_sync_error_display_marks_retryability() {
        let e = Error::sync_fatal("attribute rejected");
        assert!(e.to_string().contains("retryable: false"));
        let e = Error::sync_retryable("gateway timeout");
        assert!(e.to_string().contains("retryable: true"));
    }
}
