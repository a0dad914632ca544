//! Durable local state: the operation queue, the entity cache and a small
//! key/value table for sync metadata.
//!
//! Queue and cache writes that belong together (enqueue, completion) are
//! handed to storage in one call so they commit in one transaction.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::cache::CachedEntity;
use crate::error::Result;
use crate::operation::PendingOperation;
use crate::OperationId;
use std::future::Future;

/// Metadata key of the last completed drain (RFC 3339).
pub const LAST_SYNC_KEY: &str = "last_sync";

/// Persistence backend for queue, cache and metadata.
///
/// Methods use RPITIT (`-> impl Future + Send`) so implementations can be
/// written with plain `async fn`.
pub trait Storage: Send + Sync + 'static {
    /// All queued operations, in `id` order.
    fn load_operations(&self) -> impl Future<Output = Result<Vec<PendingOperation>>> + Send;

    /// Insert a new operation and assign its id. `entity`, when given, is
    /// written in the same transaction.
    fn insert_operation(
        &self,
        op: &PendingOperation,
        entity: Option<&CachedEntity>,
    ) -> impl Future<Output = Result<OperationId>> + Send;

    /// Overwrite an existing operation, optionally together with an entity.
    fn update_operation(
        &self,
        op: &PendingOperation,
        entity: Option<&CachedEntity>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete an operation, optionally writing an entity in the same
    /// transaction.
    fn remove_operation(
        &self,
        id: OperationId,
        entity: Option<&CachedEntity>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn load_entities(&self) -> impl Future<Output = Result<Vec<CachedEntity>>> + Send;

    fn save_entity(&self, entity: &CachedEntity) -> impl Future<Output = Result<()>> + Send;

    fn load_meta(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    fn save_meta(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;
}
