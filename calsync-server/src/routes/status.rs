//! Sync status endpoints for local UIs.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use calsync_core::{Conflict, SyncStatus};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/conflicts", get(conflicts))
}

#[derive(Serialize)]
struct StatusResponse {
    scope: Option<String>,
    #[serde(flatten)]
    status: SyncStatus,
}

/// GET /status
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        scope: state.engine.scope(),
        status: state.engine.status(),
    })
}

/// GET /conflicts - divergences awaiting manual resolution
async fn conflicts(State(state): State<AppState>) -> Json<Vec<Conflict>> {
    Json(state.engine.unresolved_conflicts().await.unwrap_or_default())
}
