//! Error types for the sync engine.

use crate::OperationId;
use thiserror::Error;

/// All errors surfaced by the sync engine.
///
/// `Clone` so that a single drain result can be handed to every caller that
/// joined the same in-progress drain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Drain errors
    #[error("device is offline")]
    Offline,

    #[error("sync is blocked until the user re-authenticates")]
    Blocked,

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("sync engine is shutting down")]
    ShuttingDown,

    #[error("drain task aborted: {0}")]
    Aborted(String),

    #[error("remote error: {0}")]
    Remote(String),

    // Queue errors
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("operation {0} is not in a failed state")]
    NotFailed(OperationId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for SyncError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::OperationNotFound(42);
        assert_eq!(err.to_string(), "operation not found: 42");

        let err = SyncError::NotFailed(7);
        assert_eq!(err.to_string(), "operation 7 is not in a failed state");

        let err = SyncError::AuthenticationRequired("token expired".into());
        assert_eq!(err.to_string(), "authentication required: token expired");
    }

    #[test]
    fn json_errors_become_serialization_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::Serialization(_)));
    }
}
