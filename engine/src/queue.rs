//! Durable FIFO of pending operations.
//!
//! Operations are grouped into streams (one per target entity). Within a
//! stream they are submitted strictly in `id` order, and a `Failed` head
//! blocks the rest of its stream until the user deals with it. Different
//! streams do not wait for each other.
//!
//! Every state change is written to storage before it becomes visible in
//! memory, so a crash at any point leaves a queue that can be resumed.

use crate::cache::{Authority, CacheStore};
use crate::config::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::operation::{
    EntityKey, FailureReason, OperationKind, OperationStatus, PendingOperation,
};
use crate::storage::Storage;
use crate::{OperationId, Version};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// What the drain should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum NextOperation {
    /// Submit this operation now.
    Ready(PendingOperation),
    /// Every submittable head is backing off; the earliest is due at this
    /// instant.
    Wait(Instant),
    /// Nothing left to submit.
    Idle,
}

/// Outcome of recording a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back off for this long, then try again.
    Retry(Duration),
    /// Retry limit reached; the operation is now `Failed`.
    Exhausted,
}

pub struct MutationQueue<S> {
    storage: Arc<S>,
    ops: BTreeMap<OperationId, PendingOperation>,
    /// In-memory backoff deadlines; a restart retries immediately.
    backoff: HashMap<OperationId, Instant>,
}

impl<S: Storage> MutationQueue<S> {
    /// Load the queue. Operations left `InFlight` by a crash go back to
    /// `Pending`; they are resubmitted under the same idempotency key.
    pub async fn open(storage: Arc<S>) -> Result<Self> {
        let mut ops = BTreeMap::new();
        let mut recovered = 0usize;

        for mut op in storage.load_operations().await? {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
                storage.update_operation(&op, None).await?;
                recovered += 1;
            }
            ops.insert(op.id, op);
        }

        tracing::info!(
            operations = ops.len(),
            recovered_in_flight = recovered,
            "Mutation queue loaded"
        );

        Ok(Self {
            storage,
            ops,
            backoff: HashMap::new(),
        })
    }

    /// Append `op` and apply it optimistically to `cache`, in one
    /// transaction. An operation whose idempotency key is already queued is
    /// not added twice; the queued record is returned instead.
    pub async fn enqueue(
        &mut self,
        mut op: PendingOperation,
        cache: &mut CacheStore<S>,
    ) -> Result<PendingOperation> {
        if let Some(existing) = self
            .ops
            .values()
            .find(|queued| queued.idempotency_key == op.idempotency_key)
        {
            tracing::debug!(op_id = existing.id, "Duplicate enqueue ignored");
            return Ok(existing.clone());
        }

        let view = cache.apply_optimistic(&op)?;
        op.id = self.storage.insert_operation(&op, Some(&view)).await?;

        tracing::debug!(
            op_id = op.id,
            stream = %op.stream_key,
            kind = op.kind.type_name(),
            base_version = op.base_version,
            "Operation enqueued"
        );

        cache.install(view);
        self.ops.insert(op.id, op.clone());
        Ok(op)
    }

    pub fn get(&self, id: OperationId) -> Option<&PendingOperation> {
        self.ops.get(&id)
    }

    /// Retryable operations in `id` order, optionally limited to one stream.
    pub fn list(&self, stream_key: Option<&str>) -> Vec<PendingOperation> {
        self.ops
            .values()
            .filter(|op| op.is_retryable())
            .filter(|op| stream_key.map_or(true, |stream| op.stream_key == stream))
            .cloned()
            .collect()
    }

    pub fn failed(&self) -> Vec<PendingOperation> {
        self.ops.values().filter(|op| op.is_failed()).cloned().collect()
    }

    /// Every queued operation for `key`, whatever its status, in order.
    pub fn for_target<'a>(
        &'a self,
        key: &'a EntityKey,
    ) -> impl Iterator<Item = &'a PendingOperation> + 'a {
        self.ops.values().filter(move |op| &op.target() == key)
    }

    /// Number of retryable (Pending or InFlight) operations.
    pub fn size(&self) -> usize {
        self.ops.values().filter(|op| op.is_retryable()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.ops.values().filter(|op| op.is_failed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Pick the next operation to submit: the lowest id among stream heads
    /// that are `Pending` and not backing off.
    pub fn next_ready(&self, now: Instant) -> NextOperation {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut earliest: Option<Instant> = None;

        for op in self.ops.values() {
            if !seen.insert(op.stream_key.as_str()) {
                continue;
            }
            if op.status != OperationStatus::Pending {
                continue;
            }
            match self.backoff.get(&op.id) {
                Some(&deadline) if deadline > now => {
                    earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
                }
                _ => return NextOperation::Ready(op.clone()),
            }
        }

        earliest.map_or(NextOperation::Idle, NextOperation::Wait)
    }

    pub async fn mark_in_flight(&mut self, id: OperationId) -> Result<PendingOperation> {
        self.modify(id, |op| {
            op.status = OperationStatus::InFlight;
            Ok(())
        })
        .await
    }

    /// Return an in-flight operation to `Pending` without counting a retry.
    pub async fn release(&mut self, id: OperationId) -> Result<PendingOperation> {
        self.modify(id, |op| {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
            }
            Ok(())
        })
        .await
    }

    pub async fn mark_failed(
        &mut self,
        id: OperationId,
        reason: FailureReason,
    ) -> Result<PendingOperation> {
        let op = self
            .modify(id, |op| {
                op.status = OperationStatus::Failed;
                op.last_error = Some(reason);
                Ok(())
            })
            .await?;
        self.backoff.remove(&id);
        Ok(op)
    }

    /// Count a transient failure and decide whether to retry.
    pub async fn record_transient_failure(
        &mut self,
        id: OperationId,
        message: String,
        policy: &RetryPolicy,
        now: Instant,
    ) -> Result<RetryDecision> {
        let op = self
            .modify(id, |op| {
                op.retry_count += 1;
                if policy.allows_retry(op.retry_count) {
                    op.status = OperationStatus::Pending;
                    op.last_error = Some(FailureReason::Transient { message });
                } else {
                    op.status = OperationStatus::Failed;
                    op.last_error = Some(FailureReason::RetriesExhausted {
                        attempts: op.retry_count,
                        message,
                    });
                }
                Ok(())
            })
            .await?;

        if op.is_failed() {
            self.backoff.remove(&id);
            return Ok(RetryDecision::Exhausted);
        }

        let delay = policy.delay_for_retry(op.retry_count);
        self.backoff.insert(id, now + delay);
        Ok(RetryDecision::Retry(delay))
    }

    /// Move an operation onto a newer server version.
    pub async fn rebase(&mut self, id: OperationId, version: Version) -> Result<PendingOperation> {
        self.modify(id, |op| {
            op.base_version = version;
            Ok(())
        })
        .await
    }

    /// Put a failed operation back into the automatic drain, optionally on
    /// a new base version. Retries start counting from zero.
    pub async fn resubmit(
        &mut self,
        id: OperationId,
        base_version: Option<Version>,
    ) -> Result<PendingOperation> {
        self.require_failed(id)?;
        let op = self
            .modify(id, |op| {
                op.status = OperationStatus::Pending;
                op.retry_count = 0;
                op.last_error = None;
                if let Some(version) = base_version {
                    op.base_version = version;
                }
                Ok(())
            })
            .await?;
        self.backoff.remove(&id);
        Ok(op)
    }

    /// Swap the intent of a failed operation for a re-derived one on the same
    /// target. It keeps its place in the stream but gets a fresh idempotency
    /// key, since it is a different action.
    pub async fn replace_kind(
        &mut self,
        id: OperationId,
        kind: OperationKind,
        base_version: Version,
        authority: Authority<'_>,
        cache: &mut CacheStore<S>,
    ) -> Result<PendingOperation> {
        let current = self.require_failed(id)?;
        if kind.target() != current.target() {
            return Err(SyncError::InvalidOperation(format!(
                "replacement targets {} instead of {}",
                kind.target(),
                current.target()
            )));
        }

        let mut replacement = PendingOperation::new(kind, base_version, Utc::now())?;
        replacement.id = id;

        let key = replacement.target();
        let view = {
            let pending = self
                .ops
                .values()
                .map(|op| if op.id == id { &replacement } else { op });
            cache.rebuild(&key, authority, pending)?
        };

        self.storage
            .update_operation(&replacement, Some(&view))
            .await?;

        tracing::debug!(op_id = id, kind = replacement.kind.type_name(), "Operation re-derived");

        self.backoff.remove(&id);
        self.ops.insert(id, replacement.clone());
        cache.install(view);
        Ok(replacement)
    }

    /// Remove an acknowledged operation and reconcile its target with
    /// `authority`. Later operations in the same stream that were created on
    /// the same base version now build on the acknowledged write.
    pub async fn mark_applied(
        &mut self,
        id: OperationId,
        authority: Authority<'_>,
        cache: &mut CacheStore<S>,
    ) -> Result<PendingOperation> {
        let applied = self.complete(id, authority, cache).await?;

        if let Authority::Entity(entity) = authority {
            let successors: Vec<OperationId> = self
                .ops
                .values()
                .filter(|op| op.stream_key == applied.stream_key)
                .filter(|op| op.base_version == applied.base_version)
                .map(|op| op.id)
                .collect();
            for successor in successors {
                self.rebase(successor, entity.version).await?;
            }
        }

        Ok(applied)
    }

    /// Remove an operation whose intent the server already covers.
    pub async fn mark_superseded(
        &mut self,
        id: OperationId,
        authority: Authority<'_>,
        cache: &mut CacheStore<S>,
    ) -> Result<PendingOperation> {
        self.complete(id, authority, cache).await
    }

    /// Drop a failed operation and rebuild its target from `authority`.
    pub async fn discard(
        &mut self,
        id: OperationId,
        authority: Authority<'_>,
        cache: &mut CacheStore<S>,
    ) -> Result<PendingOperation> {
        self.require_failed(id)?;
        self.complete(id, authority, cache).await
    }

    async fn complete(
        &mut self,
        id: OperationId,
        authority: Authority<'_>,
        cache: &mut CacheStore<S>,
    ) -> Result<PendingOperation> {
        let op = self.ops.get(&id).ok_or(SyncError::OperationNotFound(id))?;
        let key = op.target();
        let view = cache.rebuild(
            &key,
            authority,
            self.ops.values().filter(|queued| queued.id != id),
        )?;

        self.storage.remove_operation(id, Some(&view)).await?;

        self.backoff.remove(&id);
        cache.install(view);
        self.ops.remove(&id).ok_or(SyncError::OperationNotFound(id))
    }

    fn require_failed(&self, id: OperationId) -> Result<&PendingOperation> {
        let op = self.ops.get(&id).ok_or(SyncError::OperationNotFound(id))?;
        if !op.is_failed() {
            return Err(SyncError::NotFailed(id));
        }
        Ok(op)
    }

    /// Apply `change` to a copy, persist it, then publish it.
    async fn modify<F>(&mut self, id: OperationId, change: F) -> Result<PendingOperation>
    where
        F: FnOnce(&mut PendingOperation) -> Result<()>,
    {
        let mut op = self
            .ops
            .get(&id)
            .cloned()
            .ok_or(SyncError::OperationNotFound(id))?;
        change(&mut op)?;
        self.storage.update_operation(&op, None).await?;
        self.ops.insert(id, op.clone());
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ApproveVariance, UpdateCount};
    use crate::remote::RemoteEntity;
    use crate::storage::MemoryStorage;
    use chrono::{DateTime, TimeZone};
    use proptest::prelude::*;
    use serde_json::json;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn count_op(item: &str, qty: i64, ms: i64) -> PendingOperation {
        PendingOperation::new(
            OperationKind::UpdateCount(UpdateCount {
                session_id: "S1".into(),
                item_id: item.into(),
                counted_quantity: qty,
            }),
            0,
            at(ms),
        )
        .unwrap()
    }

    async fn open(
        storage: &Arc<MemoryStorage>,
    ) -> (MutationQueue<MemoryStorage>, CacheStore<MemoryStorage>) {
        let queue = MutationQueue::open(storage.clone()).await.unwrap();
        let cache = CacheStore::open(storage.clone(), "dev-1").await.unwrap();
        (queue, cache)
    }

    fn ready_id(next: NextOperation) -> OperationId {
        match next {
            NextOperation::Ready(op) => op.id,
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_persists_and_applies_optimistically() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut queue, mut cache) = open(&storage).await;

        let op = queue.enqueue(count_op("A", 4, 1), &mut cache).await.unwrap();
        assert_eq!(op.id, 1);
        assert_eq!(queue.size(), 1);

        let entity = cache.get(&EntityKey::item_line("S1", "A")).unwrap();
        assert_eq!(entity.data["countedQuantity"], 4);
        assert!(entity.optimistic);

        let (reopened, cache) = open(&storage).await;
        assert_eq!(reopened.list(None), vec![op]);
        assert_eq!(
            cache.get(&EntityKey::item_line("S1", "A")).unwrap().data["countedQuantity"],
            4
        );
    }

    #[tokio::test]
    async fn duplicate_enqueue_returns_existing() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut queue, mut cache) = open(&storage).await;

        let first = queue.enqueue(count_op("A", 4, 1), &mut cache).await.unwrap();
        let second = queue.enqueue(count_op("A", 4, 1), &mut cache).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn failed_write_changes_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut queue, mut cache) = open(&storage).await;

        storage.set_fail_writes(true);
        let result = queue.enqueue(count_op("A", 4, 1), &mut cache).await;
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert_eq!(queue.size(), 0);
        assert!(cache.get(&EntityKey::item_line("S1", "A")).is_none());
    }

    #[tokio::test]
    async fn streams_are_fifo_and_independent() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut queue, mut cache) = open(&storage).await;
        let now = Instant::now();

        let a1 = queue.enqueue(count_op("A", 1, 1), &mut cache).await.unwrap();
        let a2 = queue.enqueue(count_op("A", 2, 2), &mut cache).await.unwrap();
        let b1 = queue.enqueue(count_op("B", 1, 3), &mut cache).await.unwrap();

        assert_eq!(ready_id(queue.next_ready(now)), a1.id);

        // A blocked head holds back its own stream only.
        queue
            .mark_failed(
                a1.id,
                FailureReason::Validation {
                    status: 422,
                    message: "nope".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(ready_id(queue.next_ready(now)), b1.id);
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.failed_count(), 1);
        assert_eq!(queue.list(Some(&a2.stream_key)), vec![a2.clone()]);
    }

    #[tokio::test]
    async fn in_flight_recovers_as_pending() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut queue, mut cache) = open(&storage).await;
        let op = queue.enqueue(count_op("A", 1, 1), &mut cache).await.unwrap();
        queue.mark_in_flight(op.id).await.unwrap();

        let (reopened, _) = open(&storage).await;
        assert_eq!(reopened.get(op.id).unwrap().status, OperationStatus::Pending);
        assert_eq!(ready_id(reopened.next_ready(Instant::now())), op.id);
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_exhaust() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut queue, mut cache) = open(&storage).await;
        let policy = RetryPolicy::new(2).with_base_delay(Duration::from_secs(1));
        let now = Instant::now();

        let op = queue.enqueue(count_op("A", 1, 1), &mut cache).await.unwrap();

        let decision = queue
            .record_transient_failure(op.id, "503".into(), &policy, now)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(1)));
        assert_eq!(
            queue.next_ready(now),
            NextOperation::Wait(now + Duration::from_secs(1))
        );
        assert_eq!(
            ready_id(queue.next_ready(now + Duration::from_secs(1))),
            op.id
        );

        let decision = queue
            .record_transient_failure(op.id, "503".into(), &policy, now)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(2)));

        let decision = queue
            .record_transient_failure(op.id, "503".into(), &policy, now)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::Exhausted);

        let failed = queue.get(op.id).unwrap();
        assert!(failed.is_failed());
        assert_eq!(
            failed.last_error,
            Some(FailureReason::RetriesExhausted {
                attempts: 3,
                message: "503".into()
            })
        );
        assert_eq!(queue.next_ready(now), NextOperation::Idle);
    }

    #[tokio::test]
    async fn applied_operation_rebases_its_successors() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut queue, mut cache) = open(&storage).await;

        let first = queue.enqueue(count_op("A", 7, 1), &mut cache).await.unwrap();
        let approve = PendingOperation::new(
            OperationKind::ApproveVariance(ApproveVariance {
                session_id: "S1".into(),
                item_id: "A".into(),
                counted_quantity: 7,
                comment: None,
            }),
            0,
            at(2),
        )
        .unwrap();
        let second = queue.enqueue(approve, &mut cache).await.unwrap();

        let server = RemoteEntity {
            entity_type: crate::operation::EntityType::ItemLine,
            entity_id: "S1:A".into(),
            version: 1,
            data: json!({"sessionId": "S1", "itemId": "A", "countedQuantity": 7}),
            updated_at: at(3),
            updated_by: Some("dev-1".into()),
            deleted: false,
        };
        queue
            .mark_applied(first.id, Authority::Entity(&server), &mut cache)
            .await
            .unwrap();

        assert_eq!(queue.get(second.id).unwrap().base_version, 1);
        let entity = cache.get(&EntityKey::item_line("S1", "A")).unwrap();
        assert_eq!(entity.version, 1);
        assert_eq!(entity.data["varianceApproved"], true);
        assert!(entity.optimistic);
    }

    #[tokio::test]
    async fn discard_requires_failed_and_restores_confirmed_state() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut queue, mut cache) = open(&storage).await;
        let op = queue.enqueue(count_op("A", 7, 1), &mut cache).await.unwrap();

        assert_eq!(
            queue.discard(op.id, Authority::Unchanged, &mut cache).await,
            Err(SyncError::NotFailed(op.id))
        );

        queue
            .mark_failed(
                op.id,
                FailureReason::Validation {
                    status: 404,
                    message: "unknown item".into(),
                },
            )
            .await
            .unwrap();
        queue
            .discard(op.id, Authority::Unchanged, &mut cache)
            .await
            .unwrap();

        assert!(queue.is_empty());
        let entity = cache.get(&EntityKey::item_line("S1", "A")).unwrap();
        assert!(entity.data.is_null());
        assert!(!entity.optimistic);
    }

    #[tokio::test]
    async fn replace_kind_keeps_position_with_new_key() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut queue, mut cache) = open(&storage).await;
        let op = queue.enqueue(count_op("A", 7, 1), &mut cache).await.unwrap();
        queue
            .mark_failed(
                op.id,
                FailureReason::Validation {
                    status: 422,
                    message: "x".into(),
                },
            )
            .await
            .unwrap();

        let replacement = queue
            .replace_kind(
                op.id,
                count_op("A", 8, 9).kind,
                3,
                Authority::Unchanged,
                &mut cache,
            )
            .await
            .unwrap();

        assert_eq!(replacement.id, op.id);
        assert_eq!(replacement.base_version, 3);
        assert_ne!(replacement.idempotency_key, op.idempotency_key);
        assert_eq!(replacement.status, OperationStatus::Pending);
        assert_eq!(
            cache.get(&op.target()).unwrap().data["countedQuantity"],
            8
        );

        let other_target = count_op("B", 1, 1).kind;
        queue
            .mark_failed(
                op.id,
                FailureReason::Validation {
                    status: 422,
                    message: "x".into(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            queue
                .replace_kind(op.id, other_target, 0, Authority::Unchanged, &mut cache)
                .await,
            Err(SyncError::InvalidOperation(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn same_stream_drains_in_enqueue_order(items in prop::collection::vec(0u8..3, 1..24)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let storage = Arc::new(MemoryStorage::new());
                let (mut queue, mut cache) = open(&storage).await;

                let mut enqueued: HashMap<String, Vec<OperationId>> = HashMap::new();
                for (i, item) in items.iter().enumerate() {
                    let op = count_op(&format!("I{item}"), i as i64, i as i64);
                    let op = queue.enqueue(op, &mut cache).await.unwrap();
                    enqueued.entry(op.stream_key.clone()).or_default().push(op.id);
                }

                let mut drained: HashMap<String, Vec<OperationId>> = HashMap::new();
                while let NextOperation::Ready(op) = queue.next_ready(Instant::now()) {
                    queue.mark_in_flight(op.id).await.unwrap();
                    queue
                        .mark_applied(op.id, Authority::Unchanged, &mut cache)
                        .await
                        .unwrap();
                    drained.entry(op.stream_key.clone()).or_default().push(op.id);
                }

                assert_eq!(drained, enqueued);
                assert!(queue.is_empty());
            });
        }
    }
}
