//! In-memory system of record for count sessions.
//!
//! Holds item lines and notes keyed by [`EntityKey`], plus an idempotency
//! log of successful responses. Every accepted mutation bumps the entity
//! version by one.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use stockcount_sync::{
    EntityKey, EntityType, ItemLine, OperationKind, RemoteEntity, SyncError, Version,
};

/// Errors returned by ledger mutations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("{0} not found")]
    NotFound(EntityKey),

    #[error("{0}")]
    Invalid(String),

    #[error("{message}")]
    Conflict {
        message: String,
        current: Option<RemoteEntity>,
    },
}

/// One mutation as received from a device.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub idempotency_key: String,
    pub base_version: Version,
    pub device_id: Option<String>,
    pub kind: OperationKind,
}

/// The authoritative store.
#[derive(Debug, Default)]
pub struct Ledger {
    sessions: DashSet<String>,
    entities: DashMap<EntityKey, RemoteEntity>,
    replies: DashMap<String, RemoteEntity>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or extend) a session with its expected quantities. Lines that
    /// already exist are left alone.
    pub fn open_session(
        &self,
        session_id: &str,
        lines: impl IntoIterator<Item = (String, i64)>,
    ) -> Result<Vec<RemoteEntity>, LedgerError> {
        self.sessions.insert(session_id.to_string());

        let mut opened = Vec::new();
        for (item_id, expected) in lines {
            let key = EntityKey::item_line(session_id, &item_id);
            let entity = match self.entities.entry(key) {
                Entry::Occupied(existing) => existing.get().clone(),
                Entry::Vacant(slot) => {
                    let line = ItemLine::new(session_id, item_id).with_expected(expected);
                    let data = line.to_value().map_err(|e| LedgerError::Invalid(e.to_string()))?;
                    let entity = RemoteEntity {
                        entity_type: EntityType::ItemLine,
                        entity_id: slot.key().entity_id.clone(),
                        version: 1,
                        data,
                        updated_at: Utc::now(),
                        updated_by: None,
                        deleted: false,
                    };
                    slot.insert(entity.clone());
                    entity
                }
            };
            opened.push(entity);
        }

        tracing::info!(session = session_id, lines = opened.len(), "Session opened");
        Ok(opened)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    pub fn get(&self, key: &EntityKey) -> Option<RemoteEntity> {
        self.entities.get(key).map(|entity| entity.clone())
    }

    /// Number of distinct idempotency keys that produced an effect.
    pub fn applied_count(&self) -> usize {
        self.replies.len()
    }

    /// Apply a mutation, or replay the stored response for a known
    /// idempotency key.
    ///
    /// Only successful responses are recorded, so a key rejected with a
    /// conflict can be resubmitted on a newer base version.
    pub fn apply(&self, mutation: Mutation) -> Result<RemoteEntity, LedgerError> {
        if let Some(reply) = self.replies.get(&mutation.idempotency_key) {
            tracing::debug!(idempotency_key = %mutation.idempotency_key, "Replaying response");
            return Ok(reply.clone());
        }

        mutation.kind.validate().map_err(|e| match e {
            SyncError::InvalidOperation(message) => LedgerError::Invalid(message),
            other => LedgerError::Invalid(other.to_string()),
        })?;

        let session_id = mutation.kind.session_id();
        if !self.has_session(session_id) {
            return Err(LedgerError::UnknownSession(session_id.to_string()));
        }

        let key = mutation.kind.target();
        // The entry lock serializes writers of one entity, including
        // duplicates racing on the same key.
        let slot = self.entities.entry(key.clone());
        if let Some(reply) = self.replies.get(&mutation.idempotency_key) {
            return Ok(reply.clone());
        }

        let current = match &slot {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(_) => None,
        };
        check(&mutation, &key, current.as_ref())?;

        let data = current
            .as_ref()
            .map_or(serde_json::Value::Null, |entity| entity.data.clone());
        let actor = mutation.device_id.as_deref().unwrap_or("anonymous");
        let next = RemoteEntity {
            entity_type: key.entity_type,
            entity_id: key.entity_id.clone(),
            version: current.as_ref().map_or(0, |entity| entity.version) + 1,
            data: mutation
                .kind
                .apply_to(&data, actor)
                .map_err(|e| LedgerError::Invalid(e.to_string()))?,
            updated_at: Utc::now(),
            updated_by: mutation.device_id.clone(),
            deleted: mutation.kind.is_deletion(),
        };

        self.replies
            .insert(mutation.idempotency_key.clone(), next.clone());
        match slot {
            Entry::Occupied(mut entry) => {
                entry.insert(next.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(next.clone());
            }
        }

        tracing::info!(
            entity = %key,
            version = next.version,
            kind = mutation.kind.type_name(),
            device_id = actor,
            "Mutation applied"
        );
        Ok(next)
    }
}

/// Reject a mutation that does not fit the current state of its entity.
fn check(
    mutation: &Mutation,
    key: &EntityKey,
    current: Option<&RemoteEntity>,
) -> Result<(), LedgerError> {
    let version = current.map_or(0, |entity| entity.version);
    let live = current.is_some_and(|entity| !entity.deleted);
    let needs_existing = matches!(
        mutation.kind,
        OperationKind::ApproveVariance(_)
            | OperationKind::RequestRecount(_)
            | OperationKind::DeleteNote(_)
    );

    if mutation.base_version != version {
        return Err(LedgerError::Conflict {
            message: format!(
                "version mismatch: based on {}, current is {version}",
                mutation.base_version
            ),
            current: current.cloned(),
        });
    }
    if needs_existing && !live {
        return Err(LedgerError::NotFound(key.clone()));
    }

    if let (OperationKind::ApproveVariance(_), Some(entity)) = (&mutation.kind, current) {
        let line = ItemLine::from_value(&entity.data)
            .map_err(|e| LedgerError::Invalid(format!("stored line unreadable: {e}")))?;
        if line.variance_approved {
            return Err(LedgerError::Conflict {
                message: "variance already approved".into(),
                current: Some(entity.clone()),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockcount_sync::{ApproveVariance, CreateNote, DeleteNote, UpdateCount};

    fn ledger() -> Ledger {
        let ledger = Ledger::new();
        ledger
            .open_session("S1", [("A".to_string(), 10), ("B".to_string(), 4)])
            .unwrap();
        ledger
    }

    fn mutation(key: &str, base_version: Version, kind: OperationKind) -> Mutation {
        Mutation {
            idempotency_key: key.into(),
            base_version,
            device_id: Some("dev-1".into()),
            kind,
        }
    }

    fn count(session: &str, item: &str, quantity: i64) -> OperationKind {
        OperationKind::UpdateCount(UpdateCount {
            session_id: session.into(),
            item_id: item.into(),
            counted_quantity: quantity,
        })
    }

    fn approve(item: &str, quantity: i64) -> OperationKind {
        OperationKind::ApproveVariance(ApproveVariance {
            session_id: "S1".into(),
            item_id: item.into(),
            counted_quantity: quantity,
            comment: None,
        })
    }

    #[test]
    fn open_session_seeds_lines_once() {
        let ledger = ledger();
        let line = ledger.get(&EntityKey::item_line("S1", "A")).unwrap();
        assert_eq!(line.version, 1);
        assert_eq!(line.data["expectedQuantity"], 10);

        ledger.apply(mutation("k1", 1, count("S1", "A", 7))).unwrap();
        ledger
            .open_session("S1", [("A".to_string(), 99)])
            .unwrap();
        assert_eq!(ledger.get(&EntityKey::item_line("S1", "A")).unwrap().version, 2);
    }

    #[test]
    fn mutation_bumps_version_and_records_writer() {
        let ledger = ledger();
        let entity = ledger.apply(mutation("k1", 1, count("S1", "A", 7))).unwrap();

        assert_eq!(entity.version, 2);
        assert_eq!(entity.updated_by.as_deref(), Some("dev-1"));
        assert_eq!(entity.data["variance"], -3);
        assert_eq!(ledger.get(&entity.key()), Some(entity));
    }

    #[test]
    fn duplicate_key_replays_without_second_effect() {
        let ledger = ledger();
        let first = ledger.apply(mutation("k1", 1, count("S1", "A", 7))).unwrap();
        let second = ledger.apply(mutation("k1", 1, count("S1", "A", 7))).unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.applied_count(), 1);
        assert_eq!(ledger.get(&first.key()).unwrap().version, 2);
    }

    #[test]
    fn stale_base_conflicts_with_current_state() {
        let ledger = ledger();
        ledger.apply(mutation("k1", 1, count("S1", "A", 7))).unwrap();

        match ledger.apply(mutation("k2", 1, count("S1", "A", 8))) {
            Err(LedgerError::Conflict { current, .. }) => {
                assert_eq!(current.unwrap().version, 2);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn rejected_key_can_be_resubmitted() {
        let ledger = ledger();
        ledger.apply(mutation("k1", 1, count("S1", "A", 7))).unwrap();
        assert!(ledger.apply(mutation("k2", 1, count("S1", "A", 8))).is_err());

        let entity = ledger.apply(mutation("k2", 2, count("S1", "A", 8))).unwrap();
        assert_eq!(entity.version, 3);
    }

    #[test]
    fn second_approval_conflicts() {
        let ledger = ledger();
        ledger.apply(mutation("k1", 1, approve("A", 0))).unwrap();

        let err = ledger.apply(mutation("k2", 2, approve("A", 0))).unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { .. }));
        assert_eq!(err.to_string(), "variance already approved");
    }

    #[test]
    fn validation_and_lookup_errors() {
        let ledger = ledger();

        assert!(matches!(
            ledger.apply(mutation("k1", 1, count("S1", "A", -1))),
            Err(LedgerError::Invalid(_))
        ));
        assert!(matches!(
            ledger.apply(mutation("k2", 0, count("S9", "A", 1))),
            Err(LedgerError::UnknownSession(_))
        ));
        assert!(matches!(
            ledger.apply(mutation("k3", 0, approve("Z", 1))),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn count_creates_unknown_line_in_open_session() {
        let ledger = ledger();
        let entity = ledger.apply(mutation("k1", 0, count("S1", "NEW", 3))).unwrap();
        assert_eq!(entity.version, 1);
        assert_eq!(entity.data["countedQuantity"], 3);
        assert_eq!(entity.data["expectedQuantity"], serde_json::Value::Null);
    }

    #[test]
    fn notes_are_created_and_tombstoned() {
        let ledger = ledger();
        let create = OperationKind::CreateNote(CreateNote {
            session_id: "S1".into(),
            note_id: "n1".into(),
            body: "pallet damaged".into(),
        });
        let delete = OperationKind::DeleteNote(DeleteNote {
            session_id: "S1".into(),
            note_id: "n1".into(),
        });

        let created = ledger.apply(mutation("k1", 0, create)).unwrap();
        assert_eq!(created.data["author"], "dev-1");

        let deleted = ledger.apply(mutation("k2", 1, delete.clone())).unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.version, 2);

        assert!(matches!(
            ledger.apply(mutation("k3", 2, delete)),
            Err(LedgerError::NotFound(_))
        ));
    }
}
