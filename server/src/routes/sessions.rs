//! Session and mutation routes.

use axum::{
    extract::{Path, State},
    http::{header::IF_MATCH, HeaderMap, Method, Uri},
    routing::{delete, post, put},
    Json, Router,
};
use stockcount_sync::remote::IDEMPOTENCY_KEY_HEADER;
use stockcount_sync::{MutationBody, RemoteEntity};

use crate::auth::AuthDevice;
use crate::error::Result;
use crate::handlers::{
    handle_mutation, handle_open_session, MutationRequest, OpenSessionRequest,
    OpenSessionResponse,
};
use crate::AppState;

/// Create session routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions/{session}", put(open_session))
        .route("/sessions/{session}/items/{item}/approve", post(mutate))
        .route("/sessions/{session}/items/{item}/recount", post(mutate))
        .route("/sessions/{session}/items/{item}/count", put(mutate))
        .route("/sessions/{session}/notes", post(mutate))
        .route("/sessions/{session}/notes/{note}", delete(mutate))
}

/// PUT /sessions/{session} - Open a session with expected quantities.
async fn open_session(
    State(state): State<AppState>,
    _auth: AuthDevice,
    Path(session_id): Path<String>,
    Json(request): Json<OpenSessionRequest>,
) -> Result<Json<OpenSessionResponse>> {
    let response = handle_open_session(&state.ledger, session_id, request)?;
    Ok(Json(response))
}

/// Any mutation route. The payload must belong on the route it was sent to.
async fn mutate(
    State(state): State<AppState>,
    auth: AuthDevice,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<MutationBody>,
) -> Result<Json<RemoteEntity>> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    let request = MutationRequest {
        method,
        path: uri.path().to_string(),
        idempotency_key: header(IDEMPOTENCY_KEY_HEADER),
        if_match: header(IF_MATCH.as_str()),
        device_id: auth.device_id,
        body,
    };
    let entity = handle_mutation(&state.ledger, request)?;
    Ok(Json(entity))
}
