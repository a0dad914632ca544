//! User-facing sync status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    #[default]
    Idle,
    Draining,
    /// Halted on an authentication failure until `resume()`
    Blocked,
}

/// Everything the status is computed from.
#[derive(Debug, Clone, Copy)]
pub struct StatusInputs {
    pub is_online: bool,
    pub queued_operations: usize,
    pub failed_operations: usize,
    pub cache_size: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub state: SyncState,
}

/// Snapshot of the engine for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    /// Pending or in-flight operations
    pub queued_operations: usize,
    /// Operations waiting for a user decision
    pub failed_operations: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub cache_size: usize,
    pub needs_sync: bool,
    pub state: SyncState,
}

impl SyncStatus {
    pub fn derive(inputs: StatusInputs) -> Self {
        Self {
            is_online: inputs.is_online,
            queued_operations: inputs.queued_operations,
            failed_operations: inputs.failed_operations,
            last_sync: inputs.last_sync,
            cache_size: inputs.cache_size,
            needs_sync: inputs.queued_operations > 0,
            state: inputs.state,
        }
    }

    /// Short text for a status bar.
    pub fn label(&self) -> String {
        let mut label = match (self.state, self.is_online) {
            (SyncState::Blocked, _) => "Sign in to sync".to_string(),
            (SyncState::Draining, _) => format!("Syncing {} changes", self.queued_operations),
            (SyncState::Idle, false) if self.needs_sync => {
                format!("Offline, {} changes waiting", self.queued_operations)
            }
            (SyncState::Idle, false) => "Offline".to_string(),
            (SyncState::Idle, true) if self.needs_sync => {
                format!("{} changes waiting", self.queued_operations)
            }
            (SyncState::Idle, true) => "Up to date".to_string(),
        };
        if self.failed_operations > 0 {
            label.push_str(&format!(" ({} need attention)", self.failed_operations));
        }
        label
    }
}
