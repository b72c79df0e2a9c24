//! WebSocket upgrade route.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};

use crate::handlers::{handle_websocket_connection, DeviceQuery};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

/// GET /ws - Open a sync socket for one device.
async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let key = query.key();
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, state, key))
}
