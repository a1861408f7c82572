//! Error types for ZincServer
//!
//! The storage core returns these kinds; the HTTP layer translates them
//! into status codes via [`Error::http_status_code`].

use crate::config::ConfigError;
use thiserror::Error;

/// Common result type for ZincServer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ZincServer
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("datastore is not open")]
    DatastoreNotOpen,

    #[error("invalid head entry")]
    InvalidHeadEntry,

    #[error("corrupted entry at offset {offset}")]
    CorruptedEntry { offset: u64 },

    #[error("unexpected end of entry stream")]
    UnexpectedEof,

    #[error("datastore too large: write would grow it to {size} bytes, limit is {max_size} bytes")]
    DatastoreTooLarge { size: u64, max_size: u64 },

    #[error("transaction contains no entries")]
    EmptyTransaction,

    #[error("datastore not found: {0}")]
    DatastoreNotFound(String),

    #[error("transaction validation failed: {reason}")]
    ValidationFailed { reason: String },

    // Configuration lookups
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a load that failed with this error should be retried after a
    /// repair pass over the datastore file.
    #[must_use]
    pub const fn is_repairable(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedEof | Self::CorruptedEntry { .. } | Self::InvalidHeadEntry
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::DatastoreNotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Get the HTTP status code for this error
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::ValidationFailed { .. }
            | Self::EmptyTransaction
            | Self::UnexpectedEof
            | Self::CorruptedEntry { .. } => 400,

            // 403 Forbidden
            Self::DatastoreTooLarge { .. } => 403,

            // 404 Not Found
            Self::DatastoreNotFound(_) => 404,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => 404,

            // 500 Internal Server Error
            Self::Io(_)
            | Self::DatastoreNotOpen
            | Self::InvalidHeadEntry
            | Self::Config(_)
            | Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repairable_kinds() {
        assert!(Error::UnexpectedEof.is_repairable());
        assert!(Error::CorruptedEntry { offset: 512 }.is_repairable());
        assert!(Error::InvalidHeadEntry.is_repairable());
        assert!(!Error::EmptyTransaction.is_repairable());
        assert!(!Error::DatastoreNotFound("d1".into()).is_repairable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::DatastoreNotFound("d1".into()).is_not_found());
        assert!(Error::Io(std::io::ErrorKind::NotFound.into()).is_not_found());
        assert!(!Error::Config(ConfigError::KeyNotFound("k".into())).is_not_found());
    }

    #[test]
    fn test_error_http_status() {
        assert_eq!(Error::validation("bad").http_status_code(), 400);
        assert_eq!(
            Error::DatastoreTooLarge {
                size: 4000,
                max_size: 3000
            }
            .http_status_code(),
            403
        );
        assert_eq!(Error::DatastoreNotFound("x".into()).http_status_code(), 404);
        assert_eq!(Error::internal("boom").http_status_code(), 500);
    }
}
