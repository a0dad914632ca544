//! Mutation handler - applies one device operation to the ledger.

use crate::error::{AppError, Result};
use crate::ledger::{Ledger, Mutation};
use axum::http::Method;
use stockcount_sync::{endpoint, MutationBody, RemoteEntity};

/// A mutation request with the transport details still attached.
#[derive(Debug)]
pub struct MutationRequest {
    pub method: Method,
    pub path: String,
    pub idempotency_key: Option<String>,
    pub if_match: Option<String>,
    pub device_id: Option<String>,
    pub body: MutationBody,
}

/// Check that the request is well formed, then apply it.
pub fn handle_mutation(ledger: &Ledger, request: MutationRequest) -> Result<RemoteEntity> {
    let idempotency_key = request
        .idempotency_key
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("missing Idempotency-Key header".into()))?;

    if let Some(raw) = request.if_match.as_deref() {
        let version: u64 = raw
            .trim()
            .trim_matches('"')
            .parse()
            .map_err(|_| AppError::BadRequest(format!("invalid If-Match header: {raw}")))?;
        if version != request.body.base_version {
            return Err(AppError::BadRequest(format!(
                "If-Match {version} disagrees with baseVersion {}",
                request.body.base_version
            )));
        }
    }

    let (method, path) = endpoint(&request.body.payload);
    if method != request.method || path != request.path {
        return Err(AppError::BadRequest(format!(
            "{} payload does not belong on {} {}",
            request.body.payload.type_name(),
            request.method,
            request.path
        )));
    }

    let entity = ledger.apply(Mutation {
        idempotency_key,
        base_version: request.body.base_version,
        device_id: request.device_id,
        kind: request.body.payload,
    })?;
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockcount_sync::{OperationKind, UpdateCount};

    fn ledger() -> Ledger {
        let ledger = Ledger::new();
        ledger.open_session("S1", [("A".to_string(), 5)]).unwrap();
        ledger
    }

    fn request(path: &str) -> MutationRequest {
        MutationRequest {
            method: Method::PUT,
            path: path.into(),
            idempotency_key: Some("k1".into()),
            if_match: Some("1".into()),
            device_id: Some("dev-1".into()),
            body: MutationBody {
                base_version: 1,
                payload: OperationKind::UpdateCount(UpdateCount {
                    session_id: "S1".into(),
                    item_id: "A".into(),
                    counted_quantity: 2,
                }),
            },
        }
    }

    #[test]
    fn applies_matching_request() {
        let entity = handle_mutation(&ledger(), request("/sessions/S1/items/A/count")).unwrap();
        assert_eq!(entity.version, 2);
    }

    #[test]
    fn rejects_payload_on_wrong_route() {
        let err = handle_mutation(&ledger(), request("/sessions/S1/items/B/count")).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn requires_idempotency_key() {
        let mut req = request("/sessions/S1/items/A/count");
        req.idempotency_key = None;
        assert!(matches!(
            handle_mutation(&ledger(), req),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn if_match_must_agree_with_body() {
        let mut req = request("/sessions/S1/items/A/count");
        req.if_match = Some("\"3\"".into());
        assert!(matches!(
            handle_mutation(&ledger(), req),
            Err(AppError::BadRequest(_))
        ));
    }
}
