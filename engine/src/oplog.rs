//! Operation log.
//!
//! Append-only record of every mutation a device makes. Operations are never
//! removed: once an operation reaches a terminal status it stays in the log
//! for audit and to make replays idempotent.

use crate::{
    error::Result, DeviceKey, DocumentKey, Error, NewOperation, OperationId, OperationStatus,
    SyncOperation, Timestamp, Version,
};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Result of appending an operation that may already be known.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The operation was new and is now pending.
    Inserted(SyncOperation),
    /// An operation with this id already exists; the stored copy is returned.
    Duplicate(SyncOperation),
}

impl AppendOutcome {
    pub fn operation(&self) -> &SyncOperation {
        match self {
            AppendOutcome::Inserted(op) | AppendOutcome::Duplicate(op) => op,
        }
    }

    pub fn into_operation(self) -> SyncOperation {
        match self {
            AppendOutcome::Inserted(op) | AppendOutcome::Duplicate(op) => op,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, AppendOutcome::Inserted(_))
    }
}

/// In-memory operation log.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    entries: Vec<SyncOperation>,
    index: HashMap<OperationId, usize>,
    next_seq: u64,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new local mutation: assigns id, `pending` and `created_at`.
    pub fn record(&mut self, op: NewOperation, now: Timestamp) -> Result<SyncOperation> {
        op.validate()?;
        let op = SyncOperation::from_new(op, Uuid::new_v4().to_string(), now);
        Ok(self.insert(op))
    }

    /// Append an operation produced elsewhere (a device's own log).
    ///
    /// Unknown operations enter as pending. Known ids are left untouched, so
    /// replaying a batch never resets a terminal operation.
    pub fn append(&mut self, mut op: SyncOperation) -> Result<AppendOutcome> {
        op.validate()?;
        if let Some(existing) = self.get(&op.id) {
            return Ok(AppendOutcome::Duplicate(existing.clone()));
        }
        op.status = OperationStatus::Pending;
        op.error = None;
        op.synced_at = None;
        Ok(AppendOutcome::Inserted(self.insert(op)))
    }

    fn insert(&mut self, mut op: SyncOperation) -> SyncOperation {
        self.next_seq += 1;
        op.seq = self.next_seq;
        self.index.insert(op.id.clone(), self.entries.len());
        self.entries.push(op.clone());
        op
    }

    pub fn get(&self, id: &str) -> Option<&SyncOperation> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Pending operations of one device in replay order.
    pub fn pending(&self, key: &DeviceKey) -> Vec<SyncOperation> {
        let mut ops: Vec<SyncOperation> = self
            .entries
            .iter()
            .filter(|op| {
                op.is_pending() && op.user_id == key.user_id && op.device_id == key.device_id
            })
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.replay_order(b));
        ops
    }

    /// Pending operations on one document across the owner's devices, in
    /// replay order.
    pub fn pending_for_document(&self, key: &DocumentKey) -> Vec<SyncOperation> {
        let mut ops: Vec<SyncOperation> = self
            .entries
            .iter()
            .filter(|op| op.is_pending() && targets(op, key))
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.replay_order(b));
        ops
    }

    /// Highest version any logged operation produced for a document.
    pub fn latest_version(&self, key: &DocumentKey) -> Option<Version> {
        self.entries
            .iter()
            .filter(|op| targets(op, key))
            .map(|op| op.version)
            .max()
    }

    /// Mark an operation completed. Returns false when it was already terminal.
    pub fn mark_completed(&mut self, id: &str, at: Timestamp) -> Result<bool> {
        Ok(self.entry_mut(id)?.complete(at))
    }

    /// Mark an operation failed. Returns false when it was already terminal.
    pub fn mark_failed(&mut self, id: &str, error: &str, at: Timestamp) -> Result<bool> {
        Ok(self.entry_mut(id)?.fail(error, at))
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut SyncOperation> {
        let i = *self
            .index
            .get(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        Ok(&mut self.entries[i])
    }

    /// Every device that still has pending operations, sorted.
    pub fn devices_with_pending(&self) -> Vec<DeviceKey> {
        self.entries
            .iter()
            .filter(|op| op.is_pending())
            .map(SyncOperation::device_key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncOperation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn targets(op: &SyncOperation, key: &DocumentKey) -> bool {
    op.user_id == key.owner_id && op.collection == key.collection && op.document_id == key.document_id
}
