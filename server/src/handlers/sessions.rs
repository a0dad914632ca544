//! Session setup - seeds the expected quantities of a count.

use crate::error::{AppError, Result};
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use stockcount_sync::RemoteEntity;

/// Request body for opening a session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    #[serde(default)]
    pub items: Vec<ExpectedLine>,
}

/// Expected quantity of one item, as on record before counting.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedLine {
    pub item_id: String,
    pub expected_quantity: i64,
}

/// Response for opening a session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionResponse {
    pub session_id: String,
    pub lines: Vec<RemoteEntity>,
}

pub fn handle_open_session(
    ledger: &Ledger,
    session_id: String,
    request: OpenSessionRequest,
) -> Result<OpenSessionResponse> {
    if !valid_id(&session_id) {
        return Err(AppError::BadRequest(format!("invalid session id: {session_id:?}")));
    }
    for line in &request.items {
        if !valid_id(&line.item_id) {
            return Err(AppError::BadRequest(format!("invalid item id: {:?}", line.item_id)));
        }
        if line.expected_quantity < 0 {
            return Err(AppError::BadRequest(format!(
                "expected quantity of {} must not be negative",
                line.item_id
            )));
        }
    }

    let lines = ledger.open_session(
        &session_id,
        request
            .items
            .into_iter()
            .map(|line| (line.item_id, line.expected_quantity)),
    )?;
    Ok(OpenSessionResponse { session_id, lines })
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(item_id: &str, expected_quantity: i64) -> ExpectedLine {
        ExpectedLine {
            item_id: item_id.into(),
            expected_quantity,
        }
    }

    #[test]
    fn opens_session_with_lines() {
        let ledger = Ledger::new();
        let response = handle_open_session(
            &ledger,
            "S1".into(),
            OpenSessionRequest {
                items: vec![line("A", 3), line("B", 0)],
            },
        )
        .unwrap();

        assert_eq!(response.lines.len(), 2);
        assert!(ledger.has_session("S1"));
    }

    #[test]
    fn rejects_bad_lines() {
        let ledger = Ledger::new();
        let negative = OpenSessionRequest {
            items: vec![line("A", -1)],
        };
        assert!(handle_open_session(&ledger, "S1".into(), negative).is_err());

        let bad_id = OpenSessionRequest {
            items: vec![line("A:B", 1)],
        };
        assert!(handle_open_session(&ledger, "S1".into(), bad_id).is_err());
        assert!(!ledger.has_session("S1"));
    }
}
