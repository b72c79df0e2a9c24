//! Operation log and local mutation routes.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use larder_engine::{NewOperation, SyncOperation};

use crate::error::Result;
use crate::handlers::{
    handle_mutation, handle_pending, handle_record_operation, DeviceQuery, MutationRequest,
    PendingResponse,
};
use crate::sync::LocalSave;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/operations", post(record_operation))
        .route("/operations/pending", get(pending_operations))
        .route("/mutations", post(save_mutation))
}

/// POST /operations - Record an operation as pending.
async fn record_operation(
    State(state): State<AppState>,
    Json(op): Json<NewOperation>,
) -> Result<Json<SyncOperation>> {
    Ok(Json(handle_record_operation(&state, op).await?))
}

/// GET /operations/pending - A device's pending operations.
async fn pending_operations(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Result<Json<PendingResponse>> {
    Ok(Json(handle_pending(&state, query).await?))
}

/// POST /mutations - Save a local change and record it.
async fn save_mutation(
    State(state): State<AppState>,
    Json(request): Json<MutationRequest>,
) -> Result<Json<LocalSave>> {
    Ok(Json(handle_mutation(&state, request).await?))
}
