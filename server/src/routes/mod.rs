//! HTTP route definitions.

mod conflicts;
mod health;
mod operations;
mod sync;
mod websocket;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(operations::routes())
        .merge(sync::routes())
        .merge(conflicts::routes())
        .merge(websocket::routes())
}
