//! Sync endpoint routes.

use axum::{extract::State, routing::post, Json, Router};
use larder_engine::SyncResult;

use crate::error::Result;
use crate::handlers::{handle_changes, handle_sync, ChangesRequest, ChangesResponse, SyncRequest};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(sync_handler))
        .route("/sync/changes", post(changes_handler))
}

/// POST /sync - Run a pass for a device.
async fn sync_handler(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResult>> {
    Ok(Json(handle_sync(&state, request).await?))
}

/// POST /sync/changes - Pull server changes since the device's cursors.
async fn changes_handler(
    State(state): State<AppState>,
    Json(request): Json<ChangesRequest>,
) -> Result<Json<ChangesResponse>> {
    Ok(Json(handle_changes(&state, request).await?))
}
