//! Operation types for expressing stock-count actions.
//!
//! Every user action is captured as a [`PendingOperation`] wrapping one
//! [`OperationKind`] variant. Operations are queued locally, applied
//! optimistically to the cache, and replayed against the server in order.

use crate::conflict::ConflictDetails;
use crate::error::{Result, SyncError};
use crate::model::{ItemLine, Note};
use crate::{OperationId, Version};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for name-based idempotency keys.
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_93d4_4b0a_8e55_1d2c_7a90_3f41);

/// Longest identifier accepted for sessions, items and notes.
const MAX_ID_LEN: usize = 128;

/// Kind of entity an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    /// One item line of a count session
    ItemLine,
    /// A free-text note attached to a count session
    Note,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::ItemLine => "item-line",
            EntityType::Note => "note",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "item-line" => Ok(EntityType::ItemLine),
            "note" => Ok(EntityType::Note),
            other => Err(SyncError::InvalidOperation(format!(
                "unknown entity type: {other}"
            ))),
        }
    }
}

/// Identifies a cached or remote entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    /// Key of an item line: `{session}:{item}`.
    pub fn item_line(session_id: &str, item_id: &str) -> Self {
        Self::new(EntityType::ItemLine, format!("{session_id}:{item_id}"))
    }

    /// Key of a note: `{session}:{note}`.
    pub fn note(session_id: &str, note_id: &str) -> Self {
        Self::new(EntityType::Note, format!("{session_id}:{note_id}"))
    }

    /// The `(session, local id)` pair encoded in the entity id.
    pub fn parts(&self) -> Option<(&str, &str)> {
        self.entity_id.split_once(':')
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Approve the variance of an item line at the count the user reviewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveVariance {
    pub session_id: String,
    pub item_id: String,
    /// Counted quantity the approval was made against
    pub counted_quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Ask for an item line to be counted again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecount {
    pub session_id: String,
    pub item_id: String,
    pub reason: String,
}

/// Record a physically counted quantity for an item line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCount {
    pub session_id: String,
    pub item_id: String,
    pub counted_quantity: i64,
}

/// Attach a note to a count session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNote {
    pub session_id: String,
    pub note_id: String,
    pub body: String,
}

/// Remove a note from a count session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNote {
    pub session_id: String,
    pub note_id: String,
}

/// The closed set of actions a user can queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OperationKind {
    ApproveVariance(ApproveVariance),
    RequestRecount(RequestRecount),
    CreateNote(CreateNote),
    DeleteNote(DeleteNote),
    UpdateCount(UpdateCount),
}

impl OperationKind {
    /// Stable name of the variant, as used on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            OperationKind::ApproveVariance(_) => "approveVariance",
            OperationKind::RequestRecount(_) => "requestRecount",
            OperationKind::CreateNote(_) => "createNote",
            OperationKind::DeleteNote(_) => "deleteNote",
            OperationKind::UpdateCount(_) => "updateCount",
        }
    }

    /// The entity this operation mutates.
    pub fn target(&self) -> EntityKey {
        match self {
            OperationKind::ApproveVariance(op) => EntityKey::item_line(&op.session_id, &op.item_id),
            OperationKind::RequestRecount(op) => EntityKey::item_line(&op.session_id, &op.item_id),
            OperationKind::UpdateCount(op) => EntityKey::item_line(&op.session_id, &op.item_id),
            OperationKind::CreateNote(op) => EntityKey::note(&op.session_id, &op.note_id),
            OperationKind::DeleteNote(op) => EntityKey::note(&op.session_id, &op.note_id),
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            OperationKind::ApproveVariance(op) => &op.session_id,
            OperationKind::RequestRecount(op) => &op.session_id,
            OperationKind::UpdateCount(op) => &op.session_id,
            OperationKind::CreateNote(op) => &op.session_id,
            OperationKind::DeleteNote(op) => &op.session_id,
        }
    }

    /// Whether applying this operation tombstones its target.
    pub fn is_deletion(&self) -> bool {
        matches!(self, OperationKind::DeleteNote(_))
    }

    /// Reject malformed actions before they reach the queue.
    pub fn validate(&self) -> Result<()> {
        validate_id("session id", self.session_id())?;
        match self {
            OperationKind::ApproveVariance(op) => {
                validate_id("item id", &op.item_id)?;
                validate_quantity(op.counted_quantity)
            }
            OperationKind::RequestRecount(op) => {
                validate_id("item id", &op.item_id)?;
                if op.reason.trim().is_empty() {
                    return Err(SyncError::InvalidOperation(
                        "recount reason must not be empty".into(),
                    ));
                }
                Ok(())
            }
            OperationKind::UpdateCount(op) => {
                validate_id("item id", &op.item_id)?;
                validate_quantity(op.counted_quantity)
            }
            OperationKind::CreateNote(op) => {
                validate_id("note id", &op.note_id)?;
                if op.body.trim().is_empty() {
                    return Err(SyncError::InvalidOperation(
                        "note body must not be empty".into(),
                    ));
                }
                Ok(())
            }
            OperationKind::DeleteNote(op) => validate_id("note id", &op.note_id),
        }
    }

    /// Apply this operation to an entity's data.
    ///
    /// Shared by the optimistic cache and by the system of record, so both
    /// sides compute the same resulting state. `actor` is the device or
    /// user performing the action.
    pub fn apply_to(
        &self,
        data: &serde_json::Value,
        actor: &str,
    ) -> std::result::Result<serde_json::Value, serde_json::Error> {
        match self {
            OperationKind::ApproveVariance(op) => {
                let mut line = ItemLine::from_value_or_new(data, &op.session_id, &op.item_id)?;
                line.approve(actor, op.comment.clone());
                line.to_value()
            }
            OperationKind::RequestRecount(op) => {
                let mut line = ItemLine::from_value_or_new(data, &op.session_id, &op.item_id)?;
                line.request_recount(&op.reason);
                line.to_value()
            }
            OperationKind::UpdateCount(op) => {
                let mut line = ItemLine::from_value_or_new(data, &op.session_id, &op.item_id)?;
                line.set_count(op.counted_quantity);
                line.to_value()
            }
            OperationKind::CreateNote(op) => Note {
                session_id: op.session_id.clone(),
                note_id: op.note_id.clone(),
                body: op.body.clone(),
                author: Some(actor.to_string()),
            }
            .to_value(),
            OperationKind::DeleteNote(_) => Ok(data.clone()),
        }
    }
}

fn validate_id(label: &str, id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidOperation(format!("invalid {label}: {id:?}")))
    }
}

fn validate_quantity(quantity: i64) -> Result<()> {
    if quantity < 0 {
        return Err(SyncError::InvalidOperation(format!(
            "counted quantity must not be negative: {quantity}"
        )));
    }
    Ok(())
}

/// Lifecycle state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Failed,
    Applied,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "inFlight",
            OperationStatus::Failed => "failed",
            OperationStatus::Applied => "applied",
        }
    }
}

/// Why an operation is not (yet) applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureReason {
    /// Last transient error; the operation is still retried
    Transient { message: String },
    /// Transient errors persisted past the retry limit
    RetriesExhausted { attempts: u32, message: String },
    /// The server rejected the operation as invalid
    Validation { status: u16, message: String },
    /// Divergent server state that needs a user decision
    Conflict(ConflictDetails),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transient { message } => write!(f, "transient: {message}"),
            FailureReason::RetriesExhausted { attempts, message } => {
                write!(f, "gave up after {attempts} attempts: {message}")
            }
            FailureReason::Validation { status, message } => {
                write!(f, "rejected ({status}): {message}")
            }
            FailureReason::Conflict(details) => write!(f, "conflict: {}", details.reason),
        }
    }
}

/// A user action waiting to be acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Local sequence number, assigned by storage on enqueue
    pub id: OperationId,
    /// Ordering stream; operations sharing it are applied in `id` order
    pub stream_key: String,
    pub kind: OperationKind,
    pub idempotency_key: String,
    /// Cached version the operation was created against
    pub base_version: Version,
    pub retry_count: u32,
    pub last_error: Option<FailureReason>,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
}

impl PendingOperation {
    /// Create an unsaved operation. The id is assigned on enqueue.
    pub fn new(
        kind: OperationKind,
        base_version: Version,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let stream_key = kind.target().to_string();
        let idempotency_key = idempotency_key(&stream_key, &kind, created_at)?;

        Ok(Self {
            id: 0,
            stream_key,
            kind,
            idempotency_key,
            base_version,
            retry_count: 0,
            last_error: None,
            status: OperationStatus::Pending,
            created_at,
        })
    }

    pub fn target(&self) -> EntityKey {
        self.kind.target()
    }

    /// Pending or in flight: still part of automatic draining.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Pending | OperationStatus::InFlight
        )
    }

    pub fn is_failed(&self) -> bool {
        self.status == OperationStatus::Failed
    }

    /// Conflict payload, if the operation failed on a conflict.
    pub fn conflict(&self) -> Option<&ConflictDetails> {
        match &self.last_error {
            Some(FailureReason::Conflict(details)) => Some(details),
            _ => None,
        }
    }
}

/// Deterministic key for one logical action.
///
/// Derived from `(stream, type, payload, created_at)`, so the same action
/// always maps to the same key no matter how often it is retried.
pub fn idempotency_key(
    stream_key: &str,
    kind: &OperationKind,
    created_at: DateTime<Utc>,
) -> Result<String> {
    let payload = serde_json::to_string(kind)?;
    let name = format!(
        "{stream_key}\n{}\n{payload}\n{}",
        kind.type_name(),
        created_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    Ok(Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, name.as_bytes()).to_string())
}
