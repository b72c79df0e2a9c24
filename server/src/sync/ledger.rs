//! Durable storage for the operation log and per-device sync state.

use async_trait::async_trait;
use larder_engine::{
    AppendOutcome, DeviceKey, DocumentKey, NewOperation, OperationLog, SyncOperation, SyncState,
    SyncStateTracker, Timestamp, Version,
};
use parking_lot::Mutex;

/// Ledger failures.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Engine(#[from] larder_engine::Error),
}

/// Where pending operations and sync cursors live between passes.
#[async_trait]
pub trait SyncLedger: Send + Sync {
    /// Validate and store a freshly recorded operation with a new id.
    async fn record(&self, op: NewOperation, now: Timestamp) -> Result<SyncOperation, LedgerError> {
        op.validate()?;
        let op = SyncOperation::from_new(op, uuid::Uuid::new_v4().to_string(), now);
        Ok(self.append(op).await?.into_operation())
    }

    /// Store an operation received from a client. Ids already present are
    /// returned unchanged as duplicates.
    async fn append(&self, op: SyncOperation) -> Result<AppendOutcome, LedgerError>;

    async fn get(&self, id: &str) -> Result<Option<SyncOperation>, LedgerError>;

    /// Pending operations of one device in replay order.
    async fn pending(&self, key: &DeviceKey) -> Result<Vec<SyncOperation>, LedgerError>;

    /// Pending operations touching one document, any of the owner's devices.
    async fn pending_for_document(&self, key: &DocumentKey) -> Result<Vec<SyncOperation>, LedgerError>;

    /// Highest version ever recorded for a document.
    async fn latest_version(&self, key: &DocumentKey) -> Result<Option<Version>, LedgerError>;

    /// Returns whether the status changed; terminal operations stay as they are.
    async fn mark_completed(&self, id: &str, at: Timestamp) -> Result<bool, LedgerError>;

    async fn mark_failed(&self, id: &str, error: &str, at: Timestamp) -> Result<bool, LedgerError>;

    /// Devices with at least one pending operation.
    async fn devices_with_pending(&self) -> Result<Vec<DeviceKey>, LedgerError>;

    /// Sync state of a device, a fresh one when never saved.
    async fn load_state(&self, key: &DeviceKey) -> Result<SyncState, LedgerError>;

    async fn save_state(&self, state: &SyncState) -> Result<(), LedgerError>;
}

#[derive(Debug, Default)]
struct LedgerInner {
    log: OperationLog,
    states: SyncStateTracker,
}

/// Process-local ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations stored, any status.
    pub fn len(&self) -> usize {
        self.inner.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().log.is_empty()
    }
}

#[async_trait]
impl SyncLedger for MemoryLedger {
    async fn record(&self, op: NewOperation, now: Timestamp) -> Result<SyncOperation, LedgerError> {
        Ok(self.inner.lock().log.record(op, now)?)
    }

    async fn append(&self, op: SyncOperation) -> Result<AppendOutcome, LedgerError> {
        Ok(self.inner.lock().log.append(op)?)
    }

    async fn get(&self, id: &str) -> Result<Option<SyncOperation>, LedgerError> {
        Ok(self.inner.lock().log.get(id).cloned())
    }

    async fn pending(&self, key: &DeviceKey) -> Result<Vec<SyncOperation>, LedgerError> {
        Ok(self.inner.lock().log.pending(key))
    }

    async fn pending_for_document(&self, key: &DocumentKey) -> Result<Vec<SyncOperation>, LedgerError> {
        Ok(self.inner.lock().log.pending_for_document(key))
    }

    async fn latest_version(&self, key: &DocumentKey) -> Result<Option<Version>, LedgerError> {
        Ok(self.inner.lock().log.latest_version(key))
    }

    async fn mark_completed(&self, id: &str, at: Timestamp) -> Result<bool, LedgerError> {
        Ok(self.inner.lock().log.mark_completed(id, at)?)
    }

    async fn mark_failed(&self, id: &str, error: &str, at: Timestamp) -> Result<bool, LedgerError> {
        Ok(self.inner.lock().log.mark_failed(id, error, at)?)
    }

    async fn devices_with_pending(&self) -> Result<Vec<DeviceKey>, LedgerError> {
        Ok(self.inner.lock().log.devices_with_pending())
    }

    async fn load_state(&self, key: &DeviceKey) -> Result<SyncState, LedgerError> {
        Ok(self.inner.lock().states.get_or_default(key))
    }

    async fn save_state(&self, state: &SyncState) -> Result<(), LedgerError> {
        self.inner.lock().states.upsert(state.clone());
        Ok(())
    }
}
