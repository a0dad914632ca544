//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stockcount_sync::{
    ApproveVariance, CreateNote, DeleteNote, EntityKey, ItemLine, MemoryStorage,
    NetworkMonitor, OperationKind, RemoteApi, RemoteEntity, RemoteError, RequestRecount,
    RetryPolicy, SubmitRequest, SyncConfig, SyncCoordinator, UpdateCount,
};
use tokio::sync::watch;

pub const DEVICE: &str = "dev-1";
pub const OTHER_DEVICE: &str = "dev-2";
pub const SESSION: &str = "S1";

// ============================================================================
// Fake system of record
// ============================================================================

/// Scripted outcome for the next submission.
#[derive(Debug, Clone)]
pub enum Script {
    /// Fail without touching server state
    Fail(RemoteError),
    /// Apply the mutation, then report a timeout to the client
    LoseResponse,
}

#[derive(Default)]
struct FakeState {
    entities: HashMap<EntityKey, RemoteEntity>,
    replies: HashMap<String, RemoteEntity>,
    effects: Vec<OperationKind>,
    attempts: Vec<String>,
    script: VecDeque<Script>,
}

/// In-memory server with the same versioning rules as the real one.
pub struct FakeRemote {
    state: Mutex<FakeState>,
    delay: Mutex<Option<Duration>>,
    gate: watch::Sender<bool>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            delay: Mutex::new(None),
            gate: watch::Sender::new(true),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, step: Script) {
        self.state.lock().unwrap().script.push_back(step);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Park every submission until `release` is called.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Seed an item line at version 1.
    pub fn seed_line(&self, item_id: &str, expected: i64, counted: Option<i64>) -> RemoteEntity {
        let mut line = ItemLine::new(SESSION, item_id).with_expected(expected);
        if let Some(counted) = counted {
            line.set_count(counted);
        }
        let entity = RemoteEntity {
            entity_type: stockcount_sync::EntityType::ItemLine,
            entity_id: format!("{SESSION}:{item_id}"),
            version: 1,
            data: line.to_value().unwrap(),
            updated_at: Utc::now(),
            updated_by: None,
            deleted: false,
        };
        self.state
            .lock()
            .unwrap()
            .entities
            .insert(entity.key(), entity.clone());
        entity
    }

    /// Apply `kind` directly, as another device would, without version checks.
    pub fn write_as(&self, device: &str, kind: OperationKind) -> RemoteEntity {
        let mut state = self.state.lock().unwrap();
        apply(&mut state, &kind, device)
    }

    pub fn entity(&self, key: &EntityKey) -> Option<RemoteEntity> {
        self.state.lock().unwrap().entities.get(key).cloned()
    }

    pub fn line(&self, item_id: &str) -> ItemLine {
        let entity = self
            .entity(&EntityKey::item_line(SESSION, item_id))
            .expect("line exists on the server");
        ItemLine::from_value(&entity.data).unwrap()
    }

    /// Mutations the server actually performed for submissions, in order.
    pub fn effects(&self) -> Vec<OperationKind> {
        self.state.lock().unwrap().effects.clone()
    }

    /// Idempotency keys of every submission attempt, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.state.lock().unwrap().attempts.clone()
    }

    /// Submissions currently waiting on the delay or the hold.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn accept(&self, request: &SubmitRequest) -> Result<RemoteEntity, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(request.idempotency_key.clone());

        let lose_response = match state.script.pop_front() {
            Some(Script::Fail(error)) => return Err(error),
            Some(Script::LoseResponse) => true,
            None => false,
        };

        if let Some(reply) = state.replies.get(&request.idempotency_key) {
            return Ok(reply.clone());
        }

        let key = request.operation.target();
        let current = state.entities.get(&key).cloned();
        let current_version = current.as_ref().map_or(0, |entity| entity.version);

        let missing = current.as_ref().map_or(true, |entity| entity.deleted);
        let needs_existing = matches!(
            request.operation,
            OperationKind::ApproveVariance(_)
                | OperationKind::RequestRecount(_)
                | OperationKind::DeleteNote(_)
        );
        if missing && needs_existing && current_version == request.base_version {
            return Err(RemoteError::Validation {
                status: 404,
                message: format!("{key} not found"),
            });
        }

        if current_version != request.base_version {
            return Err(RemoteError::Conflict {
                message: format!(
                    "version mismatch: expected {}, found {current_version}",
                    request.base_version
                ),
                current,
            });
        }

        if let (OperationKind::ApproveVariance(_), Some(entity)) = (&request.operation, &current) {
            let line = ItemLine::from_value(&entity.data).unwrap();
            if line.variance_approved {
                return Err(RemoteError::Conflict {
                    message: "variance already approved".into(),
                    current,
                });
            }
        }

        let applied = apply(&mut state, &request.operation, &request.device_id);
        state.effects.push(request.operation.clone());
        state
            .replies
            .insert(request.idempotency_key.clone(), applied.clone());

        if lose_response {
            Err(RemoteError::Timeout)
        } else {
            Ok(applied)
        }
    }
}

fn apply(state: &mut FakeState, kind: &OperationKind, device: &str) -> RemoteEntity {
    let key = kind.target();
    let current = state.entities.get(&key);
    let data = current.map_or(serde_json::Value::Null, |entity| entity.data.clone());
    let version = current.map_or(0, |entity| entity.version) + 1;

    let entity = RemoteEntity {
        entity_type: key.entity_type,
        entity_id: key.entity_id.clone(),
        version,
        data: kind.apply_to(&data, device).unwrap(),
        updated_at: Utc::now(),
        updated_by: Some(device.to_string()),
        deleted: kind.is_deletion(),
    };
    state.entities.insert(key, entity.clone());
    entity
}

impl RemoteApi for FakeRemote {
    async fn submit(&self, request: SubmitRequest) -> Result<RemoteEntity, RemoteError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        self.accept(&request)
    }

    async fn fetch(&self, key: &EntityKey) -> Result<Option<RemoteEntity>, RemoteError> {
        Ok(self.entity(key))
    }
}

// ============================================================================
// Engine setup
// ============================================================================

pub fn config() -> SyncConfig {
    SyncConfig::new(DEVICE)
        .with_debounce(Duration::from_millis(50))
        .with_request_timeout(Duration::from_secs(5))
        .with_retry(RetryPolicy::new(3).with_base_delay(Duration::from_millis(100)))
}

pub type Engine = SyncCoordinator<MemoryStorage, FakeRemote>;

pub async fn engine(remote: Arc<FakeRemote>, online: bool) -> (Engine, NetworkMonitor) {
    engine_with(config(), remote, online).await
}

/// Route engine logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn engine_with(
    config: SyncConfig,
    remote: Arc<FakeRemote>,
    online: bool,
) -> (Engine, NetworkMonitor) {
    init_tracing();
    let monitor = NetworkMonitor::new(online, config.debounce);
    let storage = Arc::new(MemoryStorage::new());
    let engine = SyncCoordinator::open(config, storage, remote, monitor.clone())
        .await
        .unwrap();
    (engine, monitor)
}

/// Report online and wait out the debounce window.
pub async fn go_online(monitor: &NetworkMonitor) {
    monitor.report(true);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(monitor.is_online());
}

pub async fn go_offline(monitor: &NetworkMonitor) {
    monitor.report(false);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(!monitor.is_online());
}

// ============================================================================
// Operations
// ============================================================================

pub fn count(item_id: &str, quantity: i64) -> OperationKind {
    OperationKind::UpdateCount(UpdateCount {
        session_id: SESSION.into(),
        item_id: item_id.into(),
        counted_quantity: quantity,
    })
}

pub fn approve(item_id: &str, quantity: i64) -> OperationKind {
    OperationKind::ApproveVariance(ApproveVariance {
        session_id: SESSION.into(),
        item_id: item_id.into(),
        counted_quantity: quantity,
        comment: None,
    })
}

pub fn recount(item_id: &str, reason: &str) -> OperationKind {
    OperationKind::RequestRecount(RequestRecount {
        session_id: SESSION.into(),
        item_id: item_id.into(),
        reason: reason.into(),
    })
}

pub fn create_note(note_id: &str, body: &str) -> OperationKind {
    OperationKind::CreateNote(CreateNote {
        session_id: SESSION.into(),
        note_id: note_id.into(),
        body: body.into(),
    })
}

pub fn delete_note(note_id: &str) -> OperationKind {
    OperationKind::DeleteNote(DeleteNote {
        session_id: SESSION.into(),
        note_id: note_id.into(),
    })
}

pub fn line_key(item_id: &str) -> EntityKey {
    EntityKey::item_line(SESSION, item_id)
}

/// Poll `check` with real sleeps until it holds.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
