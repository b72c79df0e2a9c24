//! Pass completion events pushed to a user's other devices.

use larder_engine::{DeviceId, DeviceKey, DocumentId, OperationCounts, SyncResult, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// Summary of a finished pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub user_id: UserId,
    /// Device whose pass produced the event
    pub device_id: DeviceId,
    pub success: bool,
    pub operations: OperationCounts,
    /// Documents left in conflict
    #[serde(default)]
    pub conflicts: Vec<DocumentId>,
    pub timestamp: Timestamp,
}

impl SyncEvent {
    pub fn from_result(key: &DeviceKey, result: &SyncResult) -> Self {
        Self {
            user_id: key.user_id.clone(),
            device_id: key.device_id.clone(),
            success: result.success,
            operations: result.operations,
            conflicts: result
                .conflicts
                .iter()
                .map(|c| c.document_id.clone())
                .collect(),
            timestamp: result.timestamp,
        }
    }

    /// Whether the pass changed anything other devices should hear about.
    pub fn is_noteworthy(&self) -> bool {
        self.operations.completed > 0 || !self.conflicts.is_empty()
    }
}

/// Receives pass events. Implementations must not block.
pub trait EventSink: Send + Sync {
    /// Returns how many listeners were notified.
    fn publish(&self, event: &SyncEvent) -> usize;
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: &SyncEvent) -> usize {
        0
    }
}
