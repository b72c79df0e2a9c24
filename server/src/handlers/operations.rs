//! Recording operations and local mutations.

use larder_engine::{Change, CollectionName, DeviceId, DeviceKey, DocumentId, NewOperation, SyncOperation, UserId};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sync::LocalSave;
use crate::AppState;

/// Identifies the device a request speaks for.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceQuery {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

impl DeviceQuery {
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.user_id.clone(), self.device_id.clone())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResponse {
    pub operations: Vec<SyncOperation>,
}

/// A local mutation made on a device.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub collection: CollectionName,
    pub document_id: DocumentId,
    pub change: Change,
}

/// Append an operation to the log as pending.
pub async fn handle_record_operation(state: &AppState, op: NewOperation) -> Result<SyncOperation> {
    Ok(state.coordinator.record_operation(op).await?)
}

/// List a device's pending operations in replay order.
pub async fn handle_pending(state: &AppState, query: DeviceQuery) -> Result<PendingResponse> {
    let operations = state.coordinator.pending_operations(&query.key()).await?;
    Ok(PendingResponse { operations })
}

/// Apply a mutation to the cache and record it.
pub async fn handle_mutation(state: &AppState, request: MutationRequest) -> Result<LocalSave> {
    let key = DeviceKey::new(request.user_id, request.device_id);
    Ok(state
        .coordinator
        .save_local(&key, &request.collection, &request.document_id, request.change)
        .await?)
}
