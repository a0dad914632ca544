//! Entity read routes.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use stockcount_sync::RemoteEntity;

use crate::auth::AuthDevice;
use crate::error::Result;
use crate::handlers::handle_fetch;
use crate::AppState;

/// Create entity routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/entities/{entity_type}/{entity_id}", get(fetch_entity))
}

/// GET /entities/{entity_type}/{entity_id} - Current server state.
async fn fetch_entity(
    State(state): State<AppState>,
    _auth: AuthDevice,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<RemoteEntity>> {
    let entity = handle_fetch(&state.ledger, &entity_type, &entity_id)?;
    Ok(Json(entity))
}
