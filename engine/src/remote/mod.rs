//! The boundary to the system of record.
//!
//! The coordinator talks to the server only through [`RemoteApi`], so tests
//! can swap in a fake and the HTTP transport stays in one place.

mod http;

pub use http::{endpoint, HttpRemote};

use crate::operation::{EntityKey, EntityType, OperationKind, PendingOperation};
use crate::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

/// Header carrying the idempotency key of a submission.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Header identifying the submitting device.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Authoritative entity state as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Server-assigned version, incremented on every change
    pub version: Version,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    /// Device that made the last change
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteEntity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// One operation as submitted to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub idempotency_key: String,
    pub base_version: Version,
    pub device_id: String,
    pub operation: OperationKind,
}

impl SubmitRequest {
    pub fn from_operation(op: &PendingOperation, device_id: &str) -> Self {
        Self {
            idempotency_key: op.idempotency_key.clone(),
            base_version: op.base_version,
            device_id: device_id.to_string(),
            operation: op.kind.clone(),
        }
    }
}

/// JSON body of every mutation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationBody {
    pub base_version: Version,
    pub payload: OperationKind,
}

/// JSON body of every error response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorBody {
    pub error: String,
    /// Current server state, sent with 409 responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<RemoteEntity>,
}

/// How the coordinator reacts to a remote error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry later with backoff
    Transient,
    /// Fail the operation, no retry
    Validation,
    /// Halt the whole drain
    Authentication,
    /// Route through the conflict resolver
    Conflict,
}

/// Errors returned by a [`RemoteApi`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RemoteError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("rejected ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("conflict: {message}")]
    Conflict {
        message: String,
        current: Option<RemoteEntity>,
    },

    #[error("unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },
}

impl RemoteError {
    /// Map an HTTP error status and body onto the taxonomy.
    pub fn from_status(status: u16, body: ErrorBody) -> Self {
        let message = if body.error.is_empty() {
            format!("HTTP {status}")
        } else {
            body.error
        };

        match status {
            401 | 403 => RemoteError::Unauthorized { status, message },
            409 => RemoteError::Conflict {
                message,
                current: body.current,
            },
            408 | 429 => RemoteError::Server { status, message },
            400..=499 => RemoteError::Validation { status, message },
            _ => RemoteError::Server { status, message },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Timeout
            | RemoteError::Network(_)
            | RemoteError::Server { .. }
            | RemoteError::Decode(_) => ErrorClass::Transient,
            RemoteError::Validation { .. } => ErrorClass::Validation,
            RemoteError::Conflict { .. } => ErrorClass::Conflict,
            RemoteError::Unauthorized { .. } => ErrorClass::Authentication,
        }
    }
}

/// The system of record, as seen by the sync engine.
///
/// Methods use RPITIT (`-> impl Future + Send`) so implementations can be
/// written with plain `async fn`.
pub trait RemoteApi: Send + Sync + 'static {
    /// Submit one operation. Success returns the new authoritative state of
    /// the target entity.
    fn submit(
        &self,
        request: SubmitRequest,
    ) -> impl Future<Output = Result<RemoteEntity, RemoteError>> + Send;

    /// Read the current server state of an entity, `None` if it does not exist.
    fn fetch(
        &self,
        key: &EntityKey,
    ) -> impl Future<Output = Result<Option<RemoteEntity>, RemoteError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let classify = |status| RemoteError::from_status(status, ErrorBody::default()).class();

        assert_eq!(classify(401), ErrorClass::Authentication);
        assert_eq!(classify(403), ErrorClass::Authentication);
        assert_eq!(classify(409), ErrorClass::Conflict);
        assert_eq!(classify(400), ErrorClass::Validation);
        assert_eq!(classify(404), ErrorClass::Validation);
        assert_eq!(classify(422), ErrorClass::Validation);
        assert_eq!(classify(408), ErrorClass::Transient);
        assert_eq!(classify(429), ErrorClass::Transient);
        assert_eq!(classify(500), ErrorClass::Transient);
        assert_eq!(classify(503), ErrorClass::Transient);
    }

    #[test]
    fn empty_error_message_falls_back_to_status() {
        let err = RemoteError::from_status(422, ErrorBody::default());
        assert_eq!(err.to_string(), "rejected (422): HTTP 422");
    }

    #[test]
    fn conflict_keeps_current_entity() {
        let body: ErrorBody = serde_json::from_str(
            r#"{
                "error": "version mismatch",
                "current": {
                    "entityType": "item-line",
                    "entityId": "S1:A",
                    "version": 4,
                    "data": {"sessionId": "S1", "itemId": "A"},
                    "updatedAt": "2024-02-01T10:00:00Z",
                    "updatedBy": "dev-2"
                }
            }"#,
        )
        .unwrap();

        match RemoteError::from_status(409, body) {
            RemoteError::Conflict { message, current } => {
                assert_eq!(message, "version mismatch");
                let current = current.unwrap();
                assert_eq!(current.version, 4);
                assert_eq!(current.key(), EntityKey::item_line("S1", "A"));
                assert!(!current.deleted);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
