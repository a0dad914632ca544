//! The sync coordinator.
//!
//! Owns the queue and the cache, decides when to drain, submits operations
//! one at a time and routes every outcome (success, conflict, transient or
//! permanent failure) back into local state. All UI-facing calls go through
//! [`SyncCoordinator`].

use crate::cache::{Authority, CacheStore, CachedEntity};
use crate::config::SyncConfig;
use crate::conflict::{Classification, ConflictDetails, ConflictResolver, Resolution};
use crate::error::{Result, SyncError};
use crate::network::NetworkMonitor;
use crate::operation::{EntityKey, FailureReason, OperationKind, PendingOperation};
use crate::queue::{MutationQueue, NextOperation, RetryDecision};
use crate::remote::{ErrorClass, RemoteApi, RemoteEntity, RemoteError, SubmitRequest};
use crate::status::{StatusInputs, SyncState, SyncStatus};
use crate::storage::{Storage, LAST_SYNC_KEY};
use crate::OperationId;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Summary of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Accepted by the server
    pub applied: usize,
    /// Dropped because the server already covered the intent
    pub superseded: usize,
    /// Failed on validation or exhausted retries
    pub failed: usize,
    /// Failed on a conflict that needs the user
    pub conflicts: usize,
    /// Transient failures scheduled for retry
    pub retried: usize,
    /// Set when the drain stopped before running out of work
    pub halted: Option<DrainHalt>,
}

/// Why a drain stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainHalt {
    Offline,
    ShuttingDown,
}

/// The user's answer to a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum UserResolution {
    /// Submit the local intent again on top of the server state.
    KeepLocal,
    /// Drop the local intent and adopt the server state.
    KeepServer,
    /// Replace the local intent with a new one for the same entity.
    Rederive(OperationKind),
}

type DrainFuture = Shared<BoxFuture<'static, Result<DrainReport>>>;

/// State guarded by the coordinator's async lock.
struct Local<S> {
    queue: MutationQueue<S>,
    cache: CacheStore<S>,
    last_sync: Option<DateTime<Utc>>,
}

struct Inner<S, R> {
    config: SyncConfig,
    storage: Arc<S>,
    remote: Arc<R>,
    monitor: NetworkMonitor,
    resolver: ConflictResolver,
    local: Mutex<Local<S>>,
    state: watch::Sender<SyncState>,
    shutdown: watch::Sender<bool>,
    /// Signalled when a stream gains submittable work.
    work: Notify,
    inflight: StdMutex<Option<DrainFuture>>,
    background: StdMutex<Option<JoinHandle<()>>>,
}

/// Result of a network call raced against connectivity loss and shutdown.
enum Call<T> {
    Done(std::result::Result<T, RemoteError>),
    Interrupted,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Offline-first sync engine for one device.
///
/// Cheap to clone; clones share the same engine.
pub struct SyncCoordinator<S, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for SyncCoordinator<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Storage, R: RemoteApi> SyncCoordinator<S, R> {
    /// Load persisted state and build a coordinator. Nothing is submitted
    /// until a drain is triggered (see [`start`](Self::start) and
    /// [`force_sync`](Self::force_sync)).
    pub async fn open(
        config: SyncConfig,
        storage: Arc<S>,
        remote: Arc<R>,
        monitor: NetworkMonitor,
    ) -> Result<Self> {
        let cache = CacheStore::open(storage.clone(), config.device_id.clone()).await?;
        let queue = MutationQueue::open(storage.clone()).await?;

        let last_sync = match storage.load_meta(LAST_SYNC_KEY).await? {
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Ignoring unreadable last sync time");
                    None
                }
            },
            None => None,
        };

        tracing::info!(
            device_id = %config.device_id,
            queued = queue.size(),
            failed = queue.failed_count(),
            "Sync coordinator opened"
        );

        let resolver = ConflictResolver::new(config.device_id.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                storage,
                remote,
                monitor,
                resolver,
                local: Mutex::new(Local {
                    queue,
                    cache,
                    last_sync,
                }),
                state: watch::Sender::new(SyncState::Idle),
                shutdown: watch::Sender::new(false),
                work: Notify::new(),
                inflight: StdMutex::new(None),
                background: StdMutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.inner.monitor
    }

    /// Queue a user action and apply it to the cache optimistically.
    pub async fn enqueue_operation(&self, kind: OperationKind) -> Result<PendingOperation> {
        kind.validate()?;
        if *self.inner.shutdown.borrow() {
            return Err(SyncError::ShuttingDown);
        }

        let op = {
            let mut local = self.inner.local.lock().await;
            let Local { queue, cache, .. } = &mut *local;
            let base_version = cache.version(&kind.target());
            let op = PendingOperation::new(kind, base_version, Utc::now())?;
            queue.enqueue(op, cache).await?
        };
        self.inner.work.notify_one();

        tracing::info!(
            op_id = op.id,
            stream = %op.stream_key,
            kind = op.kind.type_name(),
            "Operation queued"
        );

        if self.inner.config.sync_on_enqueue && self.inner.monitor.is_online() {
            self.trigger("enqueue");
        }
        Ok(op)
    }

    pub async fn sync_status(&self) -> SyncStatus {
        let local = self.inner.local.lock().await;
        SyncStatus::derive(StatusInputs {
            is_online: self.inner.monitor.is_online(),
            queued_operations: local.queue.size(),
            failed_operations: local.queue.failed_count(),
            cache_size: local.cache.size(),
            last_sync: local.last_sync,
            state: *self.inner.state.borrow(),
        })
    }

    /// Drain now, or join the drain already running.
    ///
    /// Per-operation failures are reported in the [`DrainReport`], not as
    /// errors. Errors mean the drain could not start or was halted by an
    /// authentication failure.
    pub async fn force_sync(&self) -> Result<DrainReport> {
        self.inner.begin_drain()?.await
    }

    pub async fn list_pending_operations(&self) -> Vec<PendingOperation> {
        self.inner.local.lock().await.queue.list(None)
    }

    pub async fn list_failed_operations(&self) -> Vec<PendingOperation> {
        self.inner.local.lock().await.queue.failed()
    }

    /// Apply the user's decision to a failed operation.
    ///
    /// Returns the operation if it stays queued (`KeepLocal`, `Rederive`),
    /// `None` if it was dropped (`KeepServer`).
    pub async fn resolve_conflict(
        &self,
        id: OperationId,
        resolution: UserResolution,
    ) -> Result<Option<PendingOperation>> {
        let outcome = {
            let mut local = self.inner.local.lock().await;
            let Local { queue, cache, .. } = &mut *local;

            let op = queue
                .get(id)
                .cloned()
                .ok_or(SyncError::OperationNotFound(id))?;
            if !op.is_failed() {
                return Err(SyncError::NotFailed(id));
            }
            let key = op.target();
            let conflict = op.conflict().cloned();
            let server = conflict.as_ref().and_then(|details| details.server.clone());
            let authority = match (&conflict, &server) {
                (_, Some(entity)) => Authority::Entity(entity),
                (Some(_), None) => Authority::Absent,
                (None, None) => Authority::Unchanged,
            };

            match resolution {
                UserResolution::KeepLocal => {
                    require_conflict(id, &conflict)?;
                    let snapshot = server.as_ref().map_or(0, |entity| entity.version);
                    let cached = cache.version(&key);
                    // A refresh since the conflict may have cached newer state.
                    let (version, authority) = if cached > snapshot {
                        (cached, Authority::Unchanged)
                    } else {
                        (snapshot, authority)
                    };
                    let resubmitted = queue.resubmit(id, Some(version)).await?;
                    let pending: Vec<PendingOperation> = queue.for_target(&key).cloned().collect();
                    cache.reconcile(&key, authority, &pending).await?;
                    Some(resubmitted)
                }
                UserResolution::KeepServer => {
                    require_conflict(id, &conflict)?;
                    queue.discard(id, authority, cache).await?;
                    None
                }
                UserResolution::Rederive(kind) => {
                    kind.validate()?;
                    let base_version = match (&conflict, &server) {
                        (_, Some(entity)) => entity.version,
                        (Some(_), None) => 0,
                        (None, None) => cache.version(&key),
                    };
                    Some(
                        queue
                            .replace_kind(id, kind, base_version, authority, cache)
                            .await?,
                    )
                }
            }
        };

        tracing::info!(op_id = id, kept = outcome.is_some(), "Conflict resolved");
        self.inner.work.notify_one();
        if outcome.is_some() && self.inner.monitor.is_online() {
            self.trigger("conflict resolved");
        }
        Ok(outcome)
    }

    /// Drop a failed operation and restore the confirmed state of its entity.
    pub async fn discard_failed_operation(&self, id: OperationId) -> Result<()> {
        let mut local = self.inner.local.lock().await;
        let Local { queue, cache, .. } = &mut *local;
        queue.discard(id, Authority::Unchanged, cache).await?;
        tracing::info!(op_id = id, "Failed operation discarded");
        self.inner.work.notify_one();
        Ok(())
    }

    /// Put a failed operation back into the automatic drain.
    pub async fn retry_failed_operation(&self, id: OperationId) -> Result<PendingOperation> {
        let op = self
            .inner
            .local
            .lock()
            .await
            .queue
            .resubmit(id, None)
            .await?;
        tracing::info!(op_id = id, "Failed operation requeued");
        self.inner.work.notify_one();
        if self.inner.monitor.is_online() {
            self.trigger("retry");
        }
        Ok(op)
    }

    pub async fn cached_entity(&self, key: &EntityKey) -> Option<CachedEntity> {
        self.inner.local.lock().await.cache.get(key).cloned()
    }

    /// Re-read an entity from the server into the cache. Queued operations
    /// for it stay layered on top.
    pub async fn refresh_entity(&self, key: &EntityKey) -> Result<Option<CachedEntity>> {
        if !self.inner.monitor.is_online() {
            return Err(SyncError::Offline);
        }

        let fetched = match self.inner.call(self.inner.remote.fetch(key)).await {
            Call::Done(Ok(fetched)) => fetched,
            Call::Done(Err(err)) if err.class() == ErrorClass::Authentication => {
                return Err(SyncError::AuthenticationRequired(err.to_string()))
            }
            Call::Done(Err(err)) => return Err(SyncError::Remote(err.to_string())),
            Call::Interrupted if *self.inner.shutdown.borrow() => {
                return Err(SyncError::ShuttingDown)
            }
            Call::Interrupted => return Err(SyncError::Offline),
        };

        let mut local = self.inner.local.lock().await;
        let Local { queue, cache, .. } = &mut *local;
        let pending: Vec<PendingOperation> = queue.for_target(key).cloned().collect();

        match (&fetched, pending.is_empty()) {
            (Some(entity), true) => cache.upsert_fetched(entity).await?,
            (None, true) if cache.get(key).is_none() => return Ok(None),
            (Some(entity), false) => {
                cache
                    .reconcile(key, Authority::Entity(entity), &pending)
                    .await?;
            }
            (None, _) => {
                cache.reconcile(key, Authority::Absent, &pending).await?;
            }
        }
        Ok(cache.get(key).cloned())
    }

    /// Leave the `Blocked` state after the user re-authenticated.
    pub fn resume(&self) {
        let resumed = self.inner.state.send_if_modified(|state| {
            if *state != SyncState::Blocked {
                return false;
            }
            *state = SyncState::Idle;
            true
        });

        if resumed {
            tracing::info!("Sync resumed");
            if self.inner.monitor.is_online() {
                self.trigger("resume");
            }
        }
    }

    /// Spawn the automatic sync task: drains whenever connectivity comes
    /// back and, if configured, on a fixed interval. Calling it again is a
    /// no-op.
    pub fn start(&self) {
        let mut background = lock(&self.inner.background);
        if background.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let online = self.inner.monitor.subscribe();
        let shutdown = self.inner.shutdown.subscribe();
        let periodic = self.inner.config.periodic_sync;
        *background = Some(tokio::spawn(auto_sync(weak, online, shutdown, periodic)));

        tracing::info!(periodic_ms = periodic.map(|p| p.as_millis() as u64), "Automatic sync started");
    }

    /// Stop triggering drains, abandon any in-flight request (the operation
    /// stays queued) and wait for background work to finish.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        tracing::info!("Sync coordinator shutting down");

        let drain = { lock(&self.inner.inflight).clone() };
        if let Some(drain) = drain {
            let _ = drain.await;
        }

        let background = { lock(&self.inner.background).take() };
        if let Some(handle) = background {
            let _ = handle.await;
        }
    }

    /// Receiver for coordinator state changes.
    pub fn state_receiver(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    fn trigger(&self, reason: &'static str) {
        match self.inner.begin_drain() {
            Ok(_) => tracing::debug!(reason, "Drain triggered"),
            Err(e) => tracing::debug!(reason, error = %e, "Drain not started"),
        }
    }
}

fn require_conflict(id: OperationId, conflict: &Option<ConflictDetails>) -> Result<()> {
    if conflict.is_none() {
        return Err(SyncError::InvalidOperation(format!(
            "operation {id} did not fail on a conflict"
        )));
    }
    Ok(())
}

impl<S: Storage, R: RemoteApi> Inner<S, R> {
    /// Start a drain in its own task, or return the one already running.
    fn begin_drain(self: &Arc<Self>) -> Result<DrainFuture> {
        let mut inflight = lock(&self.inflight);
        if let Some(current) = inflight.as_ref() {
            if current.peek().is_none() {
                return Ok(current.clone());
            }
        }

        if *self.shutdown.borrow() {
            return Err(SyncError::ShuttingDown);
        }
        if *self.state.borrow() == SyncState::Blocked {
            return Err(SyncError::Blocked);
        }
        if !self.monitor.is_online() {
            return Err(SyncError::Offline);
        }

        self.state.send_replace(SyncState::Draining);
        tracing::info!("Drain started");

        let handle = tokio::spawn(self.clone().drain());
        let drain = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(SyncError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared();

        *inflight = Some(drain.clone());
        Ok(drain)
    }

    async fn drain(self: Arc<Self>) -> Result<DrainReport> {
        let result = self.run_drain().await;

        match &result {
            Ok(report) if report.halted.is_none() => {
                if let Err(e) = self.record_sync().await {
                    tracing::error!(error = %e, "Failed to persist last sync time");
                }
                tracing::info!(
                    applied = report.applied,
                    superseded = report.superseded,
                    failed = report.failed,
                    conflicts = report.conflicts,
                    retried = report.retried,
                    "Drain finished"
                );
            }
            Ok(report) => {
                tracing::info!(halted = ?report.halted, applied = report.applied, "Drain halted");
            }
            Err(SyncError::AuthenticationRequired(message)) => {
                tracing::warn!(message = %message, "Drain blocked until re-authentication");
            }
            Err(e) => tracing::error!(error = %e, "Drain failed"),
        }

        let mut inflight = lock(&self.inflight);
        *inflight = None;
        let next = if matches!(result, Err(SyncError::AuthenticationRequired(_))) {
            SyncState::Blocked
        } else {
            SyncState::Idle
        };
        self.state.send_replace(next);
        drop(inflight);

        result
    }

    async fn run_drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        loop {
            if let Some(halt) = self.halt_reason() {
                report.halted = Some(halt);
                break;
            }

            let next = self.local.lock().await.queue.next_ready(Instant::now());
            match next {
                NextOperation::Ready(op) => {
                    let id = op.id;
                    self.local.lock().await.queue.mark_in_flight(id).await?;
                    if let Err(e) = self.process(op, &mut report).await {
                        // Never leave an operation stuck in flight.
                        if let Err(release) = self.local.lock().await.queue.release(id).await {
                            tracing::error!(op_id = id, error = %release, "Failed to release operation");
                        }
                        return Err(e);
                    }
                }
                NextOperation::Wait(deadline) => {
                    tracing::debug!(
                        wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "All streams are backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.work.notified() => {}
                        _ = self.interrupted() => {}
                    }
                }
                NextOperation::Idle => break,
            }
        }

        Ok(report)
    }

    fn halt_reason(&self) -> Option<DrainHalt> {
        if *self.shutdown.borrow() {
            Some(DrainHalt::ShuttingDown)
        } else if !self.monitor.is_online() {
            Some(DrainHalt::Offline)
        } else {
            None
        }
    }

    /// Probe if needed, then submit `op`, rebasing at most once on a 409.
    async fn process(&self, mut op: PendingOperation, report: &mut DrainReport) -> Result<()> {
        let key = op.target();
        tracing::debug!(
            op_id = op.id,
            stream = %op.stream_key,
            kind = op.kind.type_name(),
            base_version = op.base_version,
            "Processing operation"
        );

        let cached_version = self.cached_version(&key).await;
        if cached_version != op.base_version {
            let server = match self.call(self.remote.fetch(&key)).await {
                Call::Done(Ok(server)) => server,
                Call::Done(Err(err)) => return self.on_remote_error(&op, err, report).await,
                Call::Interrupted => return self.abandon(&op).await,
            };

            match self.resolver.classify(&op, cached_version, server.as_ref()) {
                Classification::NoConflict { rebase_to }
                | Classification::Resolvable(Resolution::Rebase { version: rebase_to }) => {
                    if rebase_to != op.base_version {
                        op = self.local.lock().await.queue.rebase(op.id, rebase_to).await?;
                    }
                }
                Classification::Resolvable(Resolution::Superseded { authoritative }) => {
                    return self.supersede(&op, authoritative.as_ref(), report).await;
                }
                Classification::NeedsUser(details) => {
                    return self.fail_conflict(&op, details, report).await;
                }
            }
        }

        let mut rebased = false;
        loop {
            let request = SubmitRequest::from_operation(&op, &self.config.device_id);
            let error = match self.call(self.remote.submit(request)).await {
                Call::Done(Ok(entity)) => return self.apply(&op, &entity, report).await,
                Call::Done(Err(error)) => error,
                Call::Interrupted => return self.abandon(&op).await,
            };

            let (message, current) = match error {
                RemoteError::Conflict { message, current } => (message, current),
                other => return self.on_remote_error(&op, other, report).await,
            };
            tracing::warn!(op_id = op.id, message = %message, "Server reported a conflict");

            let cached_version = self.cached_version(&key).await;
            let server = match current {
                Some(entity) => Some(entity),
                None => match self.call(self.remote.fetch(&key)).await {
                    Call::Done(Ok(server)) => server,
                    Call::Done(Err(err)) => return self.on_remote_error(&op, err, report).await,
                    Call::Interrupted => return self.abandon(&op).await,
                },
            };

            if rebased {
                let details = self.resolver.details(
                    &op,
                    cached_version,
                    server.as_ref(),
                    format!("server changed again after rebase: {message}"),
                );
                return self.fail_conflict(&op, details, report).await;
            }

            match self.resolver.classify(&op, cached_version, server.as_ref()) {
                Classification::NoConflict { rebase_to }
                | Classification::Resolvable(Resolution::Rebase { version: rebase_to }) => {
                    if rebase_to == op.base_version {
                        let details =
                            self.resolver
                                .details(&op, cached_version, server.as_ref(), message);
                        return self.fail_conflict(&op, details, report).await;
                    }
                    op = self.local.lock().await.queue.rebase(op.id, rebase_to).await?;
                    rebased = true;
                }
                Classification::Resolvable(Resolution::Superseded { authoritative }) => {
                    return self.supersede(&op, authoritative.as_ref(), report).await;
                }
                Classification::NeedsUser(details) => {
                    return self.fail_conflict(&op, details, report).await;
                }
            }
        }
    }

    async fn apply(
        &self,
        op: &PendingOperation,
        entity: &RemoteEntity,
        report: &mut DrainReport,
    ) -> Result<()> {
        {
            let mut local = self.local.lock().await;
            let Local { queue, cache, .. } = &mut *local;
            queue
                .mark_applied(op.id, Authority::Entity(entity), cache)
                .await?;
        }
        report.applied += 1;
        tracing::debug!(op_id = op.id, version = entity.version, "Operation applied");
        Ok(())
    }

    async fn supersede(
        &self,
        op: &PendingOperation,
        authoritative: Option<&RemoteEntity>,
        report: &mut DrainReport,
    ) -> Result<()> {
        let authority = authoritative.map_or(Authority::Absent, Authority::Entity);
        {
            let mut local = self.local.lock().await;
            let Local { queue, cache, .. } = &mut *local;
            queue.mark_superseded(op.id, authority, cache).await?;
        }
        report.superseded += 1;
        tracing::info!(
            op_id = op.id,
            kind = op.kind.type_name(),
            "Operation superseded by server state"
        );
        Ok(())
    }

    async fn fail_conflict(
        &self,
        op: &PendingOperation,
        details: ConflictDetails,
        report: &mut DrainReport,
    ) -> Result<()> {
        tracing::warn!(op_id = op.id, reason = %details.reason, "Conflict needs the user");
        self.local
            .lock()
            .await
            .queue
            .mark_failed(op.id, FailureReason::Conflict(details))
            .await?;
        report.conflicts += 1;
        Ok(())
    }

    async fn on_remote_error(
        &self,
        op: &PendingOperation,
        error: RemoteError,
        report: &mut DrainReport,
    ) -> Result<()> {
        match error.class() {
            ErrorClass::Transient => {
                let decision = self
                    .local
                    .lock()
                    .await
                    .queue
                    .record_transient_failure(
                        op.id,
                        error.to_string(),
                        &self.config.retry,
                        Instant::now(),
                    )
                    .await?;
                match decision {
                    RetryDecision::Retry(delay) => {
                        report.retried += 1;
                        tracing::warn!(
                            op_id = op.id,
                            error = %error,
                            retry_in_ms = delay.as_millis() as u64,
                            "Transient failure"
                        );
                    }
                    RetryDecision::Exhausted => {
                        report.failed += 1;
                        tracing::error!(op_id = op.id, error = %error, "Retries exhausted");
                    }
                }
            }
            ErrorClass::Validation => {
                let (status, message) = match &error {
                    RemoteError::Validation { status, message } => (*status, message.clone()),
                    other => (0, other.to_string()),
                };
                tracing::warn!(op_id = op.id, status, message = %message, "Operation rejected");
                self.local
                    .lock()
                    .await
                    .queue
                    .mark_failed(op.id, FailureReason::Validation { status, message })
                    .await?;
                report.failed += 1;
            }
            ErrorClass::Authentication => {
                self.local.lock().await.queue.release(op.id).await?;
                return Err(SyncError::AuthenticationRequired(error.to_string()));
            }
            ErrorClass::Conflict => {
                let cached_version = self.cached_version(&op.target()).await;
                let details = self
                    .resolver
                    .details(op, cached_version, None, error.to_string());
                self.fail_conflict(op, details, report).await?;
            }
        }
        Ok(())
    }

    async fn abandon(&self, op: &PendingOperation) -> Result<()> {
        self.local.lock().await.queue.release(op.id).await?;
        tracing::debug!(op_id = op.id, "Submission abandoned");
        Ok(())
    }

    async fn cached_version(&self, key: &EntityKey) -> crate::Version {
        self.local.lock().await.cache.version(key)
    }

    async fn record_sync(&self) -> Result<()> {
        let now = Utc::now();
        self.storage.save_meta(LAST_SYNC_KEY, &now.to_rfc3339()).await?;
        self.local.lock().await.last_sync = Some(now);
        Ok(())
    }

    /// Run `request` bounded by the request timeout, giving up early if the
    /// device goes offline or the engine shuts down.
    async fn call<T>(
        &self,
        request: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> Call<T> {
        tokio::select! {
            biased;
            _ = self.interrupted() => Call::Interrupted,
            outcome = tokio::time::timeout(self.config.request_timeout, request) => match outcome {
                Ok(result) => Call::Done(result),
                Err(_elapsed) => Call::Done(Err(RemoteError::Timeout)),
            },
        }
    }

    /// Resolves once the device is offline or shutdown was requested.
    async fn interrupted(&self) {
        let mut online = self.monitor.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if !*online.borrow_and_update() || *shutdown.borrow_and_update() {
                return;
            }
            tokio::select! {
                changed = online.changed() => if changed.is_err() { return },
                changed = shutdown.changed() => if changed.is_err() { return },
            }
        }
    }
}

async fn auto_sync<S: Storage, R: RemoteApi>(
    weak: Weak<Inner<S, R>>,
    mut online: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    periodic: Option<Duration>,
) {
    let mut ticker = periodic.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut trigger = *online.borrow_and_update();

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        if trigger {
            let Some(inner) = weak.upgrade() else { break };
            let drain = inner.begin_drain();
            drop(inner);

            match drain {
                Ok(drain) => {
                    if let Err(e) = drain.await {
                        tracing::debug!(error = %e, "Automatic drain ended with an error");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Automatic drain not started"),
            }
        }

        trigger = tokio::select! {
            changed = online.changed() => match changed {
                Ok(()) => *online.borrow_and_update(),
                Err(_) => break,
            },
            _ = next_tick(&mut ticker) => true,
            changed = shutdown.changed() => match changed {
                Ok(()) => false,
                Err(_) => break,
            },
        };
    }

    tracing::debug!("Automatic sync stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
