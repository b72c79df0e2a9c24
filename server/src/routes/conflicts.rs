//! Conflict resolution and record listing routes.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};

use crate::error::Result;
use crate::handlers::{handle_records, handle_resolve, RecordsQuery, RecordsResponse, ResolveRequest};
use crate::sync::Resolution;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/conflicts/{document_id}/resolve", post(resolve_conflict))
        .route("/records", get(list_records))
}

/// POST /conflicts/{document_id}/resolve - Settle an owner's conflict with `local` or `server`.
async fn resolve_conflict(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Resolution>> {
    Ok(Json(handle_resolve(&state, &document_id, request).await?))
}

/// GET /records - Cached records of an owner.
async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> Json<RecordsResponse> {
    Json(handle_records(&state, query))
}
