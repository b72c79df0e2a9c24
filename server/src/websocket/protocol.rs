//! WebSocket message protocol definitions.
//!
//! All messages are JSON objects tagged by `type`. Envelope fields use
//! snake_case; sync payloads keep their own camelCase form.

use std::collections::BTreeMap;

use larder_engine::{CollectionName, ServerDocument, SyncOperation, SyncResult};
use serde::{Deserialize, Serialize};

use crate::sync::SyncEvent;

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run a pass for this connection's device, optionally submitting
    /// operations from the device's own log first.
    Sync {
        #[serde(default)]
        operations: Vec<SyncOperation>,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Fetch server changes since the device's cursors.
    Pull {
        /// Collections to pull; empty means all
        #[serde(default)]
        collections: Vec<CollectionName>,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Outcome of a `sync` request.
    SyncResult {
        result: SyncResult,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Outcome of a `pull` request.
    Changes {
        changes: BTreeMap<CollectionName, Vec<ServerDocument>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Another device of the same user finished a pass.
    SyncCompleted { event: SyncEvent },

    /// Response to ping.
    Pong,

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }
}
