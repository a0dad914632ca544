//! Local entity cache.
//!
//! Every entity keeps two layers: the last state confirmed by the server
//! (`confirmed_data`, `version`) and the view shown to the user (`data`),
//! which is the confirmed state with all still-queued operations for that
//! entity replayed on top.

use crate::error::Result;
use crate::operation::{EntityKey, EntityType, PendingOperation};
use crate::remote::RemoteEntity;
use crate::storage::Storage;
use crate::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One cached entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Last server version this device has seen, 0 if never seen
    pub version: Version,
    /// What the UI shows
    pub data: Value,
    pub deleted: bool,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Server-confirmed state underneath the optimistic overlay
    pub confirmed_data: Value,
    pub confirmed_deleted: bool,
    /// `data` includes queued, unacknowledged operations
    pub optimistic: bool,
}

impl CachedEntity {
    /// An entity the server has never reported.
    pub fn placeholder(key: EntityKey) -> Self {
        Self {
            entity_type: key.entity_type,
            entity_id: key.entity_id,
            version: 0,
            data: Value::Null,
            deleted: false,
            fetched_at: None,
            confirmed_data: Value::Null,
            confirmed_deleted: false,
            optimistic: false,
        }
    }

    pub fn from_remote(remote: &RemoteEntity) -> Self {
        Self {
            entity_type: remote.entity_type,
            entity_id: remote.entity_id.clone(),
            version: remote.version,
            data: remote.data.clone(),
            deleted: remote.deleted,
            fetched_at: Some(Utc::now()),
            confirmed_data: remote.data.clone(),
            confirmed_deleted: remote.deleted,
            optimistic: false,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Live means present and not tombstoned.
    pub fn is_live(&self) -> bool {
        !self.deleted && !self.data.is_null()
    }
}

/// Server truth used to rebuild an entity.
#[derive(Debug, Clone, Copy)]
pub enum Authority<'a> {
    /// The server reported this state.
    Entity(&'a RemoteEntity),
    /// The server has no such entity.
    Absent,
    /// Keep the confirmed state already cached.
    Unchanged,
}

/// Keyed store of [`CachedEntity`] values, backed by [`Storage`].
pub struct CacheStore<S> {
    storage: Arc<S>,
    actor: String,
    entities: HashMap<EntityKey, CachedEntity>,
}

impl<S: Storage> CacheStore<S> {
    /// Load the cache from storage. `actor` is recorded as the author of
    /// optimistic changes.
    pub async fn open(storage: Arc<S>, actor: impl Into<String>) -> Result<Self> {
        let entities = storage
            .load_entities()
            .await?
            .into_iter()
            .map(|entity| (entity.key(), entity))
            .collect::<HashMap<_, _>>();

        tracing::debug!(entities = entities.len(), "Cache loaded");

        Ok(Self {
            storage,
            actor: actor.into(),
            entities,
        })
    }

    pub fn get(&self, key: &EntityKey) -> Option<&CachedEntity> {
        self.entities.get(key)
    }

    /// Cached server version of `key`, 0 if unknown.
    pub fn version(&self, key: &EntityKey) -> Version {
        self.entities.get(key).map_or(0, |entity| entity.version)
    }

    /// Number of live entities.
    pub fn size(&self) -> usize {
        self.entities.values().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The view of `op`'s target after applying `op` on top of the current
    /// view. Nothing is stored.
    pub fn apply_optimistic(&self, op: &PendingOperation) -> Result<CachedEntity> {
        let key = op.target();
        let mut entity = self
            .entities
            .get(&key)
            .cloned()
            .unwrap_or_else(|| CachedEntity::placeholder(key));
        self.overlay(&mut entity, op)?;
        Ok(entity)
    }

    /// Rebuild `key` from `authority` with `pending` replayed on top.
    /// Nothing is stored.
    pub fn rebuild<'a>(
        &self,
        key: &EntityKey,
        authority: Authority<'_>,
        pending: impl IntoIterator<Item = &'a PendingOperation>,
    ) -> Result<CachedEntity> {
        let current = self.entities.get(key);
        let mut entity = match authority {
            Authority::Entity(remote) => CachedEntity::from_remote(remote),
            Authority::Absent => {
                let mut entity = CachedEntity::placeholder(key.clone());
                entity.version = current.map_or(0, |e| e.version);
                entity.confirmed_deleted = true;
                entity.deleted = true;
                entity.fetched_at = Some(Utc::now());
                entity
            }
            Authority::Unchanged => {
                let mut entity = current
                    .cloned()
                    .unwrap_or_else(|| CachedEntity::placeholder(key.clone()));
                entity.data = entity.confirmed_data.clone();
                entity.deleted = entity.confirmed_deleted;
                entity.optimistic = false;
                entity
            }
        };

        for op in pending.into_iter().filter(|op| &op.target() == key) {
            self.overlay(&mut entity, op)?;
        }
        Ok(entity)
    }

    /// Replace the in-memory copy. Callers persist first.
    pub fn install(&mut self, entity: CachedEntity) {
        self.entities.insert(entity.key(), entity);
    }

    /// Overwrite `key` with server truth, re-layer `pending`, and persist.
    pub async fn reconcile<'a>(
        &mut self,
        key: &EntityKey,
        authority: Authority<'_>,
        pending: impl IntoIterator<Item = &'a PendingOperation>,
    ) -> Result<&CachedEntity> {
        let entity = self.rebuild(key, authority, pending)?;
        self.storage.save_entity(&entity).await?;
        self.install(entity);
        Ok(&self.entities[key])
    }

    /// Seed the cache from a server read when nothing is queued for it.
    pub async fn upsert_fetched(&mut self, remote: &RemoteEntity) -> Result<()> {
        let entity = CachedEntity::from_remote(remote);
        self.storage.save_entity(&entity).await?;
        self.install(entity);
        Ok(())
    }

    fn overlay(&self, entity: &mut CachedEntity, op: &PendingOperation) -> Result<()> {
        entity.data = op.kind.apply_to(&entity.data, &self.actor)?;
        // Every kind other than a deletion (re)creates its target.
        entity.deleted = op.kind.is_deletion();
        entity.optimistic = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{CreateNote, DeleteNote, OperationKind, UpdateCount};
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn count(qty: i64) -> PendingOperation {
        PendingOperation::new(
            OperationKind::UpdateCount(UpdateCount {
                session_id: "S1".into(),
                item_id: "A".into(),
                counted_quantity: qty,
            }),
            0,
            Utc::now(),
        )
        .unwrap()
    }

    fn remote_line(version: Version, counted: i64) -> RemoteEntity {
        RemoteEntity {
            entity_type: EntityType::ItemLine,
            entity_id: "S1:A".into(),
            version,
            data: json!({"sessionId": "S1", "itemId": "A", "expectedQuantity": 10, "countedQuantity": counted}),
            updated_at: Utc::now(),
            updated_by: Some("dev-2".into()),
            deleted: false,
        }
    }

    async fn cache() -> CacheStore<MemoryStorage> {
        CacheStore::open(Arc::new(MemoryStorage::new()), "dev-1")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn optimistic_view_keeps_confirmed_layer() {
        let mut cache = cache().await;
        cache.upsert_fetched(&remote_line(2, 8)).await.unwrap();

        let view = cache.apply_optimistic(&count(9)).unwrap();
        assert_eq!(view.version, 2);
        assert_eq!(view.data["countedQuantity"], 9);
        assert_eq!(view.data["variance"], -1);
        assert_eq!(view.confirmed_data["countedQuantity"], 8);
        assert!(view.optimistic);
    }

    #[tokio::test]
    async fn reconcile_relayers_pending() {
        let mut cache = cache().await;
        let key = EntityKey::item_line("S1", "A");
        let pending = vec![count(11)];

        let entity = cache
            .reconcile(&key, Authority::Entity(&remote_line(5, 7)), &pending)
            .await
            .unwrap();
        assert_eq!(entity.version, 5);
        assert_eq!(entity.confirmed_data["countedQuantity"], 7);
        assert_eq!(entity.data["countedQuantity"], 11);
        assert!(entity.optimistic);

        let entity = cache
            .reconcile(&key, Authority::Unchanged, std::iter::empty())
            .await
            .unwrap();
        assert_eq!(entity.data["countedQuantity"], 7);
        assert!(!entity.optimistic);
    }

    #[tokio::test]
    async fn notes_and_tombstones() {
        let mut cache = cache().await;
        let create = PendingOperation::new(
            OperationKind::CreateNote(CreateNote {
                session_id: "S1".into(),
                note_id: "n1".into(),
                body: "aisle 3 blocked".into(),
            }),
            0,
            Utc::now(),
        )
        .unwrap();
        let view = cache.apply_optimistic(&create).unwrap();
        assert!(view.is_live());
        assert_eq!(view.data["author"], "dev-1");
        cache.install(view);
        assert_eq!(cache.size(), 1);

        let delete = PendingOperation::new(
            OperationKind::DeleteNote(DeleteNote {
                session_id: "S1".into(),
                note_id: "n1".into(),
            }),
            0,
            Utc::now(),
        )
        .unwrap();
        let view = cache.apply_optimistic(&delete).unwrap();
        assert!(view.deleted);
        cache.install(view);
        assert_eq!(cache.size(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn absent_authority_tombstones() {
        let mut cache = cache().await;
        let key = EntityKey::note("S1", "n9");
        let entity = cache
            .reconcile(&key, Authority::Absent, std::iter::empty())
            .await
            .unwrap();
        assert!(entity.deleted);
        assert!(!entity.is_live());
    }

    #[tokio::test]
    async fn reopen_restores_entities() {
        let storage = Arc::new(MemoryStorage::new());
        let mut cache = CacheStore::open(storage.clone(), "dev-1").await.unwrap();
        cache.upsert_fetched(&remote_line(3, 4)).await.unwrap();

        let reopened = CacheStore::open(storage, "dev-1").await.unwrap();
        assert_eq!(reopened.version(&EntityKey::item_line("S1", "A")), 3);
        assert_eq!(reopened.size(), 1);
    }
}
