//! Sync passes and pulls.

use std::collections::BTreeMap;

use larder_engine::{
    CollectionName, DeviceId, DeviceKey, ServerDocument, SyncOperation, SyncResult, UserId,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sync::{EventSink, SyncEvent};
use crate::AppState;

/// Run a pass for a device, optionally submitting operations from its log.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub user_id: UserId,
    pub device_id: DeviceId,
    #[serde(default)]
    pub operations: Vec<SyncOperation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesRequest {
    pub user_id: UserId,
    pub device_id: DeviceId,
    /// Collections to pull; empty means all
    #[serde(default)]
    pub collections: Vec<CollectionName>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    pub changes: BTreeMap<CollectionName, Vec<ServerDocument>>,
}

/// Run a pass and tell the user's other devices about it.
pub async fn handle_sync(state: &AppState, request: SyncRequest) -> Result<SyncResult> {
    let key = DeviceKey::new(request.user_id, request.device_id);
    let result = state
        .coordinator
        .sync_changes(&key, request.operations)
        .await?;

    let event = SyncEvent::from_result(&key, &result);
    if event.is_noteworthy() {
        let notified = state.conn_manager.publish(&event);
        tracing::debug!(device = %key, notified, "Published sync event");
    }

    Ok(result)
}

/// Server changes since the device's cursors.
pub async fn handle_changes(state: &AppState, request: ChangesRequest) -> Result<ChangesResponse> {
    let key = DeviceKey::new(request.user_id, request.device_id);
    let changes = state
        .coordinator
        .get_changes_since_last_sync(&key, &request.collections)
        .await?;
    Ok(ChangesResponse { changes })
}
