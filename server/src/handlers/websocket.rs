//! Sync sockets.
//!
//! Client messages go through the same handlers as the HTTP routes. Events
//! published for the user are forwarded to the socket as they arrive.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use larder_engine::DeviceKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::websocket::{ClientMessage, ServerMessage};
use crate::AppState;

use super::{handle_changes, handle_sync, ChangesRequest, SyncRequest};

/// Serve one device's socket until it closes.
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, key: DeviceKey) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();

    let conn_manager = state.conn_manager.clone();
    let conn_id = conn_manager.register(key.user_id.clone(), key.device_id.clone(), tx);
    let forwarder = spawn_forwarder(sink, rx);

    while let Some(frame) = stream.next().await {
        let reply = match frame {
            Ok(Message::Text(text)) => process_message(&text, &state, &key).await,
            Ok(Message::Binary(_)) => ServerMessage::error("binary frames are not supported", None),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket receive failed: {}", e);
                break;
            }
        };
        if !conn_manager.send_to(&conn_id, reply) {
            break;
        }
    }

    conn_manager.unregister(&conn_id);
    forwarder.abort();
    tracing::info!(
        conn_id = %conn_id,
        device = %key,
        active_connections = conn_manager.connection_count(),
        "WebSocket closed"
    );
}

/// Drain queued messages into the socket until either side goes away.
fn spawn_forwarder(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Dropping unserializable message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    })
}

/// Process a client message and return the reply.
pub async fn process_message(text: &str, state: &AppState, key: &DeviceKey) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => return ServerMessage::error(format!("Invalid message format: {}", e), None),
    };

    match client_msg {
        ClientMessage::Sync {
            operations,
            request_id,
        } => {
            let request = SyncRequest {
                user_id: key.user_id.clone(),
                device_id: key.device_id.clone(),
                operations,
            };
            match handle_sync(state, request).await {
                Ok(result) => ServerMessage::SyncResult { result, request_id },
                Err(e) => ServerMessage::error(e.to_string(), request_id),
            }
        }

        ClientMessage::Pull {
            collections,
            request_id,
        } => {
            let request = ChangesRequest {
                user_id: key.user_id.clone(),
                device_id: key.device_id.clone(),
                collections,
            };
            match handle_changes(state, request).await {
                Ok(response) => ServerMessage::Changes {
                    changes: response.changes,
                    request_id,
                },
                Err(e) => ServerMessage::error(e.to_string(), request_id),
            }
        }

        ClientMessage::Ping => ServerMessage::Pong,
    }
}
