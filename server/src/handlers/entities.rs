//! Entity reads, used by devices to probe current server state.

use crate::error::{AppError, Result};
use crate::ledger::Ledger;
use std::str::FromStr;
use stockcount_sync::{EntityKey, EntityType, RemoteEntity};

/// Look up one entity. Tombstoned notes are returned, not hidden.
pub fn handle_fetch(ledger: &Ledger, entity_type: &str, entity_id: &str) -> Result<RemoteEntity> {
    let entity_type =
        EntityType::from_str(entity_type).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let key = EntityKey::new(entity_type, entity_id);
    ledger
        .get(&key)
        .ok_or_else(|| AppError::NotFound(key.to_string()))
}
