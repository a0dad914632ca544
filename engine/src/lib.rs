//! # stockcount-sync
//!
//! Offline-first sync engine for stock-count field apps.
//!
//! Counters keep working when the warehouse Wi-Fi drops: every action is
//! queued locally, shown immediately through an optimistic cache, and
//! replayed against the system of record once connectivity returns.
//!
//! ## Core Concepts
//!
//! ### Operations
//!
//! User actions are captured as an [`OperationKind`]:
//! - [`ApproveVariance`] - Approve the variance of an item line
//! - [`RequestRecount`] - Ask for an item line to be counted again
//! - [`UpdateCount`] - Record a counted quantity
//! - [`CreateNote`] / [`DeleteNote`] - Session notes
//!
//! Each queued [`PendingOperation`] carries the version of the entity it was
//! created against and a deterministic idempotency key, so a retried
//! submission is recognized by the server as the same action.
//!
//! ### Streams
//!
//! Operations on the same entity form a stream and reach the server in
//! exactly the order they were queued. Streams are independent of each
//! other.
//!
//! ### Conflicts
//!
//! When the server moved on since an operation was queued, the
//! [`ConflictResolver`] decides per operation kind whether to resubmit on
//! top of the new state, drop the operation because the server already
//! covers it, or hand the conflict to the user.
//!
//! ### Connectivity
//!
//! The [`NetworkMonitor`] debounces raw connectivity readings. A drain starts
//! when the device is reliably back online, on [`SyncCoordinator::force_sync`],
//! and optionally on a timer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stockcount_sync::{
//!     HttpRemote, NetworkMonitor, OperationKind, SqliteStorage, SyncConfig, SyncCoordinator,
//!     UpdateCount,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::new("tablet-7");
//! let storage = Arc::new(SqliteStorage::open("counts.db").await?);
//! let remote = Arc::new(HttpRemote::new(
//!     "https://counts.example.com/api",
//!     config.request_timeout,
//! )?);
//! let monitor = NetworkMonitor::new(true, config.debounce);
//!
//! let sync = SyncCoordinator::open(config, storage, remote, monitor).await?;
//! sync.start();
//!
//! sync.enqueue_operation(OperationKind::UpdateCount(UpdateCount {
//!     session_id: "S1".into(),
//!     item_id: "SKU-9".into(),
//!     counted_quantity: 4,
//! }))
//! .await?;
//!
//! println!("{}", sync.sync_status().await.label());
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! [`SqliteStorage`] keeps the queue, the cache and sync metadata in one
//! SQLite database. [`MemoryStorage`] is a drop-in replacement for tests.

pub mod cache;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod network;
pub mod operation;
pub mod queue;
pub mod remote;
pub mod status;
pub mod storage;

// Re-export main types at crate root
pub use cache::{Authority, CacheStore, CachedEntity};
pub use config::{RetryPolicy, SyncConfig};
pub use conflict::{Classification, ConflictDetails, ConflictResolver, Resolution};
pub use coordinator::{DrainHalt, DrainReport, SyncCoordinator, UserResolution};
pub use error::SyncError;
pub use model::{ItemLine, Note};
pub use network::NetworkMonitor;
pub use operation::{
    ApproveVariance, CreateNote, DeleteNote, EntityKey, EntityType, FailureReason,
    OperationKind, OperationStatus, PendingOperation, RequestRecount, UpdateCount,
};
pub use queue::{MutationQueue, NextOperation, RetryDecision};
pub use remote::{
    endpoint, ErrorBody, ErrorClass, HttpRemote, MutationBody, RemoteApi, RemoteEntity,
    RemoteError, SubmitRequest,
};
pub use status::{StatusInputs, SyncState, SyncStatus};
pub use storage::{MemoryStorage, SqliteStorage, Storage};

/// Type aliases for clarity
pub type OperationId = u64;
pub type Version = u64;
