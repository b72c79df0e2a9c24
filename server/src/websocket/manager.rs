//! WebSocket connection manager.
//!
//! Tracks active connections per user and fans pass events out to a user's
//! other devices.

use std::sync::Arc;

use dashmap::DashMap;
use larder_engine::{DeviceId, UserId};
use tokio::sync::mpsc;

use super::ServerMessage;
use crate::sync::{EventSink, SyncEvent};

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub sender: MessageSender,
}

/// Active WebSocket connections, shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, Connection>,
    /// Connection ids by user
    by_user: DashMap<UserId, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a connection. Returns its id.
    pub fn register(&self, user_id: UserId, device_id: DeviceId, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.by_user
            .entry(user_id.clone())
            .or_default()
            .push(conn_id.clone());
        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                user_id: user_id.clone(),
                device_id: device_id.clone(),
                sender,
            },
        );

        tracing::info!(conn_id = %conn_id, user_id = %user_id, device_id = %device_id, "WebSocket connection registered");
        conn_id
    }

    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(mut conn_ids) = self.by_user.get_mut(&conn.user_id) {
                conn_ids.retain(|id| id != conn_id);
                if conn_ids.is_empty() {
                    drop(conn_ids);
                    self.by_user.remove(&conn.user_id);
                }
            }

            tracing::info!(conn_id = %conn_id, user_id = %conn.user_id, "WebSocket connection unregistered");
        }
    }

    /// Send to every connection of `user_id` except those of `device_id`.
    ///
    /// Returns the number of connections that received the message.
    pub fn notify_user_except(&self, user_id: &str, device_id: &str, message: &ServerMessage) -> usize {
        let conn_ids = match self.by_user.get(user_id) {
            Some(ids) => ids.clone(),
            None => return 0,
        };

        let sent = conn_ids
            .iter()
            .filter_map(|id| self.connections.get(id))
            .filter(|conn| conn.device_id != device_id)
            .filter(|conn| conn.sender.send(message.clone()).is_ok())
            .count();

        tracing::debug!(user_id = %user_id, recipients = sent, "Notified user connections");
        sent
    }

    /// Send a message to one connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        self.connections
            .get(conn_id)
            .map(|conn| conn.sender.send(message).is_ok())
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }
}

impl EventSink for ConnectionManager {
    fn publish(&self, event: &SyncEvent) -> usize {
        let message = ServerMessage::SyncCompleted {
            event: event.clone(),
        };
        self.notify_user_except(&event.user_id, &event.device_id, &message)
    }
}
