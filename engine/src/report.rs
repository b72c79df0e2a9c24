//! Sync pass bookkeeping and the result report.

use crate::{
    error::ErrorKind, CollectionName, Conflict, DocumentId, Error, OperationId, SyncOperation,
    Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operation counts of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Left pending because the server copy is newer
    #[serde(default)]
    pub conflicted: usize,
    /// Left pending because of an earlier conflict or a cancel
    #[serde(default)]
    pub skipped: usize,
}

/// A per-operation failure inside a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub operation_id: OperationId,
    pub document_id: DocumentId,
    pub collection: CollectionName,
    pub kind: ErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(op: &SyncOperation, error: &Error) -> Self {
        Self {
            operation_id: op.id.clone(),
            document_id: op.document_id.clone(),
            collection: op.collection.clone(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// True when no operation failed
    pub success: bool,
    pub operations: OperationCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<OperationError>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    pub timestamp: Timestamp,
}

impl SyncResult {
    /// Result of a pass that found nothing to do.
    pub fn empty(timestamp: Timestamp) -> Self {
        PassTally::new(0).finish(timestamp)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CollectionProgress {
    unfinished: bool,
    max_version: Version,
}

/// Accumulates per-operation outcomes while a pass runs.
///
/// Also tracks which collections had every drained operation reach a
/// terminal status, since only those cursors may advance.
#[derive(Debug, Clone, Default)]
pub struct PassTally {
    counts: OperationCounts,
    errors: Vec<OperationError>,
    conflicts: Vec<Conflict>,
    progress: BTreeMap<CollectionName, CollectionProgress>,
    cancelled: bool,
    aborted: bool,
}

impl PassTally {
    /// Start a tally for a pass draining `total` operations.
    pub fn new(total: usize) -> Self {
        Self {
            counts: OperationCounts {
                total,
                ..OperationCounts::default()
            },
            ..Self::default()
        }
    }

    fn touch(&mut self, collection: &str) -> &mut CollectionProgress {
        self.progress.entry(collection.to_string()).or_default()
    }

    pub fn completed(&mut self, op: &SyncOperation) {
        self.counts.completed += 1;
        let progress = self.touch(&op.collection);
        progress.max_version = progress.max_version.max(op.version);
    }

    /// The operation failed and was marked failed (terminal).
    pub fn failed(&mut self, op: &SyncOperation, error: &Error) {
        self.counts.failed += 1;
        self.errors.push(OperationError::new(op, error));
        self.touch(&op.collection);
    }

    pub fn conflicted(&mut self, op: &SyncOperation, conflict: Conflict) {
        self.counts.conflicted += 1;
        self.conflicts.push(conflict);
        self.touch(&op.collection).unfinished = true;
    }

    /// Left pending behind an earlier conflict on the same document.
    pub fn deferred(&mut self, op: &SyncOperation) {
        self.counts.skipped += 1;
        self.touch(&op.collection).unfinished = true;
    }

    /// Reported failed without being attempted; stays pending.
    pub fn untried(&mut self, op: &SyncOperation, error: &Error) {
        self.counts.failed += 1;
        self.errors.push(OperationError::new(op, error));
        self.touch(&op.collection).unfinished = true;
    }

    /// A cancel stopped the pass before `op`; it stays pending.
    pub fn cancelled(&mut self, op: &SyncOperation) {
        self.cancelled = true;
        self.counts.skipped += 1;
        self.touch(&op.collection).unfinished = true;
    }

    /// The store became unreachable: no cursor may move in this pass.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Collections whose cursors may advance, with the highest completed
    /// version. Empty for an aborted pass.
    pub fn cursor_advances(&self) -> BTreeMap<CollectionName, Version> {
        if self.aborted {
            return BTreeMap::new();
        }
        self.progress
            .iter()
            .filter(|(_, p)| !p.unfinished)
            .map(|(c, p)| (c.clone(), p.max_version))
            .collect()
    }

    pub fn counts(&self) -> OperationCounts {
        self.counts
    }

    pub fn finish(self, timestamp: Timestamp) -> SyncResult {
        SyncResult {
            success: self.counts.failed == 0,
            operations: self.counts,
            errors: (!self.errors.is_empty()).then_some(self.errors),
            conflicts: self.conflicts,
            cancelled: self.cancelled,
            timestamp,
        }
    }
}
