use super::Storage;
use crate::cache::CachedEntity;
use crate::error::{Result, SyncError};
use crate::operation::{EntityKey, PendingOperation};
use crate::OperationId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct MemoryInner {
    operations: BTreeMap<OperationId, PendingOperation>,
    next_id: OperationId,
    entities: HashMap<EntityKey, CachedEntity>,
    meta: HashMap<String, String>,
    fail_writes: bool,
}

/// In-memory [`Storage`].
///
/// Clones share state, so a test can "restart" an engine on the same data.
/// Not persisted across process restarts.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        let guard = self.lock();
        if guard.fail_writes {
            return Err(SyncError::Storage("write rejected".into()));
        }
        Ok(guard)
    }
}

impl Storage for MemoryStorage {
    async fn load_operations(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.lock().operations.values().cloned().collect())
    }

    async fn insert_operation(
        &self,
        op: &PendingOperation,
        entity: Option<&CachedEntity>,
    ) -> Result<OperationId> {
        let mut inner = self.writable()?;
        if inner
            .operations
            .values()
            .any(|existing| existing.idempotency_key == op.idempotency_key)
        {
            return Err(SyncError::Storage(format!(
                "duplicate idempotency key: {}",
                op.idempotency_key
            )));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let mut stored = op.clone();
        stored.id = id;
        inner.operations.insert(id, stored);
        if let Some(entity) = entity {
            inner.entities.insert(entity.key(), entity.clone());
        }
        Ok(id)
    }

    async fn update_operation(
        &self,
        op: &PendingOperation,
        entity: Option<&CachedEntity>,
    ) -> Result<()> {
        let mut inner = self.writable()?;
        if !inner.operations.contains_key(&op.id) {
            return Err(SyncError::OperationNotFound(op.id));
        }
        inner.operations.insert(op.id, op.clone());
        if let Some(entity) = entity {
            inner.entities.insert(entity.key(), entity.clone());
        }
        Ok(())
    }

    async fn remove_operation(&self, id: OperationId, entity: Option<&CachedEntity>) -> Result<()> {
        let mut inner = self.writable()?;
        inner.operations.remove(&id);
        if let Some(entity) = entity {
            inner.entities.insert(entity.key(), entity.clone());
        }
        Ok(())
    }

    async fn load_entities(&self) -> Result<Vec<CachedEntity>> {
        Ok(self.lock().entities.values().cloned().collect())
    }

    async fn save_entity(&self, entity: &CachedEntity) -> Result<()> {
        self.writable()?.entities.insert(entity.key(), entity.clone());
        Ok(())
    }

    async fn load_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().meta.get(key).cloned())
    }

    async fn save_meta(&self, key: &str, value: &str) -> Result<()> {
        self.writable()?
            .meta
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
