//! Conflict classification.
//!
//! When the server's version of an entity has moved past the version an
//! operation was created against, the [`ConflictResolver`] decides whether
//! the divergence is harmless, can be resolved automatically, or must be
//! shown to the user.
//!
//! The decision is made per operation kind:
//!
//! | Operation         | Server state                         | Outcome      |
//! |-------------------|--------------------------------------|--------------|
//! | `approveVariance` | already approved                     | superseded   |
//! | `approveVariance` | counted quantity changed, or deleted | needs user   |
//! | `requestRecount`  | recount already requested            | superseded   |
//! | `updateCount`     | same count                           | superseded   |
//! | `updateCount`     | approved at a different count        | needs user   |
//! | `updateCount`     | changed after the local edit         | superseded   |
//! | `createNote`      | same note exists                     | superseded   |
//! | `createNote`      | different note under the same id     | needs user   |
//! | `deleteNote`      | already gone                         | superseded   |
//!
//! A missing entity is no conflict for `createNote` and `updateCount`.
//!
//! Everything else is rebased onto the server version and submitted again.

use crate::model::{ItemLine, Note};
use crate::operation::{OperationKind, PendingOperation};
use crate::remote::RemoteEntity;
use crate::Version;
use serde::{Deserialize, Serialize};

/// What the user sees for a conflict that could not be resolved
/// automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetails {
    /// The local intent
    pub local: OperationKind,
    /// Server state at detection time, `None` if the entity does not exist
    pub server: Option<RemoteEntity>,
    /// Version the local cache held when the conflict was detected
    pub cached_version: Version,
    /// Version the operation was created against
    pub base_version: Version,
    pub reason: String,
}

/// Automatic resolution of a divergence.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Resubmit against `version`.
    Rebase { version: Version },
    /// The server already reflects the intent; drop the operation and adopt
    /// the authoritative state.
    Superseded { authoritative: Option<RemoteEntity> },
}

/// Outcome of [`ConflictResolver::classify`].
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// The server has not diverged; submit against `rebase_to`.
    NoConflict { rebase_to: Version },
    Resolvable(Resolution),
    NeedsUser(ConflictDetails),
}

/// Classifies divergence between a queued operation and server state.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    device_id: String,
}

impl ConflictResolver {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Classify `op` against the server's current state of its target.
    ///
    /// `cached_version` is the version the local cache holds for the target.
    pub fn classify(
        &self,
        op: &PendingOperation,
        cached_version: Version,
        server: Option<&RemoteEntity>,
    ) -> Classification {
        let Some(server) = server else {
            return self.classify_missing(op);
        };

        // First approval wins, even when this device had already read it.
        if let OperationKind::ApproveVariance(_) = &op.kind {
            if !server.deleted && item_line(server).is_ok_and(|line| line.variance_approved) {
                return Classification::Resolvable(Resolution::Superseded {
                    authoritative: Some(server.clone()),
                });
            }
        }

        if server.version == op.base_version {
            return Classification::NoConflict {
                rebase_to: server.version,
            };
        }

        // Our own earlier write moved the version; nothing foreign happened.
        if server.updated_by.as_deref() == Some(self.device_id.as_str())
            && server.version == cached_version
        {
            return Classification::NoConflict {
                rebase_to: server.version,
            };
        }

        let outcome = match &op.kind {
            OperationKind::ApproveVariance(approve) => {
                item_line(server).and_then(|line| {
                    if server.deleted {
                        Err("item line was removed on the server".into())
                    } else if line.variance_approved {
                        Ok(Outcome::Superseded)
                    } else if line.counted_quantity != Some(approve.counted_quantity) {
                        Err(format!(
                            "counted quantity changed from {} to {} since the variance was reviewed",
                            approve.counted_quantity,
                            describe(line.counted_quantity)
                        ))
                    } else {
                        Ok(Outcome::Rebase)
                    }
                })
            }
            OperationKind::RequestRecount(_) => item_line(server).map(|line| {
                if line.recount_requested {
                    Outcome::Superseded
                } else {
                    Outcome::Rebase
                }
            }),
            OperationKind::UpdateCount(update) => item_line(server).and_then(|line| {
                if line.counted_quantity == Some(update.counted_quantity) {
                    Ok(Outcome::Superseded)
                } else if line.variance_approved {
                    Err(format!(
                        "variance was approved at count {} on the server",
                        describe(line.counted_quantity)
                    ))
                } else if server.updated_at > op.created_at {
                    // Last writer wins on plain counts.
                    Ok(Outcome::Superseded)
                } else {
                    Ok(Outcome::Rebase)
                }
            }),
            OperationKind::CreateNote(create) => {
                if server.deleted {
                    Ok(Outcome::Rebase)
                } else {
                    match Note::from_value(&server.data) {
                        Ok(note) if note.body == create.body => Ok(Outcome::Superseded),
                        Ok(_) => Err("a different note with this id exists on the server".into()),
                        Err(e) => Err(format!("unreadable server note: {e}")),
                    }
                }
            }
            OperationKind::DeleteNote(_) => Ok(if server.deleted {
                Outcome::Superseded
            } else {
                Outcome::Rebase
            }),
        };

        match outcome {
            Ok(Outcome::Rebase) => Classification::Resolvable(Resolution::Rebase {
                version: server.version,
            }),
            Ok(Outcome::Superseded) => Classification::Resolvable(Resolution::Superseded {
                authoritative: Some(server.clone()),
            }),
            Err(reason) => Classification::NeedsUser(self.details(
                op,
                cached_version,
                Some(server),
                reason,
            )),
        }
    }

    /// Build the user-facing payload for a conflict.
    pub fn details(
        &self,
        op: &PendingOperation,
        cached_version: Version,
        server: Option<&RemoteEntity>,
        reason: impl Into<String>,
    ) -> ConflictDetails {
        ConflictDetails {
            local: op.kind.clone(),
            server: server.cloned(),
            cached_version,
            base_version: op.base_version,
            reason: reason.into(),
        }
    }

    fn classify_missing(&self, op: &PendingOperation) -> Classification {
        match &op.kind {
            OperationKind::DeleteNote(_) => Classification::Resolvable(Resolution::Superseded {
                authoritative: None,
            }),
            OperationKind::CreateNote(_) | OperationKind::UpdateCount(_) => {
                Classification::NoConflict { rebase_to: 0 }
            }
            // Left to server validation.
            _ if op.base_version == 0 => Classification::NoConflict { rebase_to: 0 },
            _ => Classification::Resolvable(Resolution::Rebase { version: 0 }),
        }
    }
}

enum Outcome {
    Rebase,
    Superseded,
}

fn item_line(server: &RemoteEntity) -> Result<ItemLine, String> {
    ItemLine::from_value(&server.data).map_err(|e| format!("unreadable server item line: {e}"))
}

fn describe(quantity: Option<i64>) -> String {
    quantity.map_or_else(|| "none".to_string(), |q| q.to_string())
}
