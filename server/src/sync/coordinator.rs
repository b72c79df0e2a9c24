//! The sync coordinator.
//!
//! Owns the record cache and drives passes: drain a device's pending
//! operations in order, ask the detector what each one means against the
//! server copy, apply the decision, then settle the device's cursors.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use larder_engine::{
    plan_local_resolution, Change, Clock, CollectionName, Conflict, ConflictChoice,
    ConflictDetector, Decision, DeviceId, DeviceKey, DocumentKey, Error as EngineError, NewOperation,
    OperationId, Origin, PassTally, RecordCache, Schema, ServerDocument, SyncOperation,
    SyncResult, SyncStatus, Timestamp, Version, VersionedRecord,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{DeviceLocks, LockPolicy, SyncError, SyncLedger};
use crate::config::Config;
use crate::store::{DocumentStore, StoreError};

/// Tunables of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Upper bound on each document store call
    pub operation_timeout: Duration,
    /// Lock behaviour of on-demand passes
    pub lock_policy: LockPolicy,
    /// Advisory TTL of cached records
    pub cache_ttl: Option<Duration>,
}

impl From<&Config> for CoordinatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            operation_timeout: config.operation_timeout,
            lock_policy: config.lock_policy,
            cache_ttl: config.cache_ttl,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Result of a local mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSave {
    /// The cached record after the mutation; `None` for deletes
    pub record: Option<VersionedRecord>,
    pub operation: SyncOperation,
}

/// Result of a manual conflict choice.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// The conflict as it stood, with the choice filled in
    pub conflict: Conflict,
    /// The cached record afterwards; `None` when local resolved to a delete
    pub record: Option<VersionedRecord>,
    /// Fresh operation enqueued by a `local` choice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<SyncOperation>,
    /// Stale operations closed by the choice
    pub superseded: Vec<OperationId>,
}

enum Outcome {
    Completed,
    Conflict(Conflict),
}

enum ApplyError {
    /// The store cannot be reached; the pass stops.
    Unavailable(EngineError),
    /// This operation failed; the pass goes on.
    Failed(EngineError),
}

pub struct SyncCoordinator {
    store: Arc<dyn DocumentStore>,
    ledger: Arc<dyn SyncLedger>,
    clock: Arc<dyn Clock>,
    schema: Schema,
    config: CoordinatorConfig,
    locks: DeviceLocks,
    cache: Mutex<RecordCache>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        ledger: Arc<dyn SyncLedger>,
        clock: Arc<dyn Clock>,
        schema: Schema,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            schema,
            config,
            locks: DeviceLocks::new(),
            cache: Mutex::new(RecordCache::new()),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Whether a pass is running for `key` right now.
    pub fn is_syncing(&self, key: &DeviceKey) -> bool {
        self.locks.is_locked(key)
    }

    /// Append a mutation to the operation log as pending.
    pub async fn record_operation(&self, op: NewOperation) -> Result<SyncOperation, SyncError> {
        self.schema.validate_operation(&op)?;
        let recorded = self.ledger.record(op, self.clock.now()).await?;
        tracing::debug!(
            op_id = %recorded.id,
            document_id = %recorded.document_id,
            version = recorded.version,
            "Operation recorded"
        );
        Ok(recorded)
    }

    /// Pending operations of a device in replay order.
    pub async fn pending_operations(&self, key: &DeviceKey) -> Result<Vec<SyncOperation>, SyncError> {
        Ok(self.ledger.pending(key).await?)
    }

    /// Devices with work waiting.
    pub async fn devices_with_pending(&self) -> Result<Vec<DeviceKey>, SyncError> {
        Ok(self.ledger.devices_with_pending().await?)
    }

    /// Apply a mutation to the local cache and record it for the next pass.
    ///
    /// Updates and deletes of documents missing from the cache start from the
    /// server copy. The new version is one past both the cached version and
    /// the highest version already in the log. Creates never replace an
    /// existing document, and another user's document is never touched.
    pub async fn save_local(
        &self,
        key: &DeviceKey,
        collection: &str,
        document_id: &str,
        change: Change,
    ) -> Result<LocalSave, SyncError> {
        let mut op = NewOperation::new(
            key.user_id.clone(),
            key.device_id.clone(),
            collection,
            document_id,
            change,
            1,
        );
        self.schema.validate_operation(&op)?;
        let doc = op.document_key();

        let cached = self.cache.lock().peek(&doc).is_some();
        let server = if cached {
            None
        } else {
            self.fetch(self.store.find(collection, document_id)).await?
        };
        if server.as_ref().is_some_and(|s| s.owner_id != key.user_id) {
            return Err(EngineError::NotOwner(document_id.to_string()).into());
        }
        if matches!(op.change, Change::Create { .. }) && (cached || server.is_some()) {
            return Err(EngineError::DocumentExists(document_id.to_string()).into());
        }
        let base = server.map(|copy| VersionedRecord::from_server(&copy, self.clock.now()));
        let floor = self.ledger.latest_version(&doc).await?.unwrap_or(0);
        let now = self.clock.now();
        let ttl = self.config.cache_ttl;

        let (staged, previous) = {
            let mut cache = self.cache.lock();
            let previous = cache.peek(&doc).cloned();
            let staged = stage_local(&op, previous.clone().or(base), floor, now)?;
            op.version = match &staged {
                Staged::Record(record) => record.version,
                Staged::Removed(version) => *version,
            };
            match &staged {
                Staged::Record(record) => cache.restore(record.clone(), ttl, now),
                Staged::Removed(_) => {
                    cache.delete(&doc);
                }
            }
            (staged, previous)
        };

        let operation = match self.ledger.record(op, now).await {
            Ok(operation) => operation,
            Err(err) => {
                let mut cache = self.cache.lock();
                match previous {
                    Some(record) => cache.restore(record, ttl, now),
                    None => {
                        cache.delete(&doc);
                    }
                }
                return Err(err.into());
            }
        };

        tracing::debug!(
            device = %key,
            document_id = %document_id,
            version = operation.version,
            "Local change saved"
        );

        Ok(LocalSave {
            record: match staged {
                Staged::Record(record) => Some(record),
                Staged::Removed(_) => None,
            },
            operation,
        })
    }

    /// Accept operations from a device's own log, then run a pass for it.
    ///
    /// Operations already known by id are left as they are, so a device may
    /// resend its whole log after a lost response.
    pub async fn sync_changes(
        &self,
        key: &DeviceKey,
        ops: Vec<SyncOperation>,
    ) -> Result<SyncResult, SyncError> {
        for op in &ops {
            if op.user_id != key.user_id || op.device_id != key.device_id {
                return Err(EngineError::InvalidOperation(format!(
                    "operation {} belongs to {}, not {}",
                    op.id,
                    op.device_key(),
                    key
                ))
                .into());
            }
            op.validate()?;
            self.schema.validate_change(&op.collection, &op.change)?;
        }

        for op in ops {
            let outcome = self.ledger.append(op).await?;
            if !outcome.is_new() {
                tracing::debug!(op_id = %outcome.operation().id, "Operation already known");
            }
        }

        self.sync_pending(key, &CancellationToken::new()).await
    }

    /// Run a pass over the device's recorded operations under the configured
    /// lock policy.
    pub async fn sync_pending(
        &self,
        key: &DeviceKey,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        self.sync_device(key, self.config.lock_policy, cancel).await
    }

    /// Run a pass with an explicit lock policy.
    pub async fn sync_device(
        &self,
        key: &DeviceKey,
        policy: LockPolicy,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        let _guard = match self.locks.acquire(key, policy).await {
            Ok(guard) => guard,
            Err(err) => {
                tracing::debug!(device = %key, "Sync pass not started: {}", err);
                return Err(err);
            }
        };
        self.run_pass(key, cancel).await
    }

    async fn run_pass(
        &self,
        key: &DeviceKey,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        let ops = self.ledger.pending(key).await?;
        let mut state = self.ledger.load_state(key).await?;
        tracing::info!(device = %key, pending = ops.len(), "Sync pass started");

        let mut tally = PassTally::new(ops.len());
        let mut blocked: HashSet<DocumentKey> = HashSet::new();
        let mut queue = ops.iter();

        while let Some(op) = queue.next() {
            if cancel.is_cancelled() {
                tally.cancelled(op);
                queue.by_ref().for_each(|rest| tally.cancelled(rest));
                tracing::info!(device = %key, "Sync pass cancelled");
                break;
            }

            // Later edits to a conflicted document wait for the resolution.
            if blocked.contains(&op.document_key()) {
                tally.deferred(op);
                continue;
            }

            match self.apply(op).await {
                Ok(Outcome::Completed) => {
                    self.ledger.mark_completed(&op.id, self.clock.now()).await?;
                    tally.completed(op);
                }
                Ok(Outcome::Conflict(conflict)) => {
                    tracing::info!(
                        device = %key,
                        document_id = %conflict.document_id,
                        local_version = conflict.local_version,
                        remote_version = conflict.remote_version,
                        "Conflict detected"
                    );
                    blocked.insert(op.document_key());
                    tally.conflicted(op, conflict);
                }
                Err(ApplyError::Failed(err)) => {
                    tracing::warn!(
                        device = %key,
                        op_id = %op.id,
                        document_id = %op.document_id,
                        "Operation failed: {}",
                        err
                    );
                    self.ledger
                        .mark_failed(&op.id, &err.to_string(), self.clock.now())
                        .await?;
                    tally.failed(op, &err);
                }
                Err(ApplyError::Unavailable(err)) => {
                    tracing::error!(device = %key, "Sync pass aborted: {}", err);
                    tally.abort();
                    tally.untried(op, &err);
                    queue.by_ref().for_each(|rest| tally.untried(rest, &err));
                    break;
                }
            }
        }

        let now = self.clock.now();
        if !tally.is_aborted() {
            state.advance(&tally.cursor_advances(), now);
            self.ledger.save_state(&state).await?;
        }

        let counts = tally.counts();
        tracing::info!(
            device = %key,
            total = counts.total,
            completed = counts.completed,
            failed = counts.failed,
            conflicted = counts.conflicted,
            skipped = counts.skipped,
            "Sync pass finished"
        );
        Ok(tally.finish(now))
    }

    async fn apply(&self, op: &SyncOperation) -> Result<Outcome, ApplyError> {
        let server = self
            .call(self.store.find(&op.collection, &op.document_id))
            .await?;
        let now = self.clock.now();
        let decision = ConflictDetector::new(&self.schema)
            .detect(op, server.as_ref(), now)
            .map_err(ApplyError::Failed)?;

        match decision {
            Decision::Create(document) => {
                self.call(self.store.create(&document)).await?;
                self.confirm_push(op, &document, now);
                Ok(Outcome::Completed)
            }
            Decision::Update(document) => {
                self.call(self.store.update(&document)).await?;
                self.confirm_push(op, &document, now);
                Ok(Outcome::Completed)
            }
            Decision::Remove => {
                self.call(self.store.delete(&op.collection, &op.document_id))
                    .await?;
                self.drop_local(op);
                Ok(Outcome::Completed)
            }
            Decision::Orphaned => {
                tracing::debug!(
                    op_id = %op.id,
                    document_id = %op.document_id,
                    "Server copy gone, dropping local record"
                );
                self.drop_local(op);
                Ok(Outcome::Completed)
            }
            Decision::Conflict { conflict, server } => {
                self.flag_conflict(op, server, now);
                Ok(Outcome::Conflict(conflict))
            }
        }
    }

    /// One store call under the per-call timeout, classified for a pass.
    async fn call<T, F>(&self, call: F) -> Result<T, ApplyError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.operation_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.is_unavailable() => Err(ApplyError::Unavailable(err.into())),
            Ok(Err(err)) => Err(ApplyError::Failed(err.into())),
            Err(_) => Err(ApplyError::Failed(self.timeout_error())),
        }
    }

    /// One store call under the per-call timeout, outside a pass.
    async fn fetch<T, F>(&self, call: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.operation_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(self.timeout_error().into()),
        }
    }

    fn timeout_error(&self) -> EngineError {
        EngineError::Timeout(self.config.operation_timeout.as_millis() as u64)
    }

    /// A push landed. The cached record is synced only if nothing newer was
    /// saved locally since; a cached copy behind the push is replaced.
    fn confirm_push(&self, op: &SyncOperation, document: &ServerDocument, now: Timestamp) {
        let mut cache = self.cache.lock();
        if let Some(record) = cache.peek_mut(&op.document_key()) {
            if record.version == op.version {
                record.mark_synced(now);
            }
            if record.version >= op.version {
                return;
            }
        }
        let record = VersionedRecord::from_server(document, now).with_device(op.device_id.clone());
        cache.put(record, self.config.cache_ttl, Origin::Remote, now);
    }

    fn drop_local(&self, op: &SyncOperation) {
        let doc = op.document_key();
        let mut cache = self.cache.lock();
        if cache
            .peek(&doc)
            .is_some_and(|record| record.version <= op.version)
        {
            cache.delete(&doc);
        }
    }

    fn flag_conflict(&self, op: &SyncOperation, server: ServerDocument, now: Timestamp) {
        let mut cache = self.cache.lock();
        if let Some(record) = cache.peek_mut(&op.document_key()) {
            record.mark_conflict_from(server, op.device_id.clone());
            return;
        }

        // No local copy: rebuild it from the operation so the conflict is visible.
        let data = match op.change.apply_to(Some(&server.data)) {
            Ok(Some(data)) => data,
            _ => server.data.clone(),
        };
        let mut record = VersionedRecord::new_local(
            op.document_id.clone(),
            op.collection.clone(),
            op.user_id.clone(),
            data,
            now,
        )
        .with_device(op.device_id.clone());
        record.version = op.version;
        record.mark_conflict_from(server, op.device_id.clone());
        cache.restore(record, self.config.cache_ttl, now);
    }

    /// Server documents of the device's user changed since its cursors.
    ///
    /// Cached records that are synced are refreshed; pending and conflicted
    /// ones are left alone. Cursors do not move. An empty `collections` means
    /// every collection of the schema.
    pub async fn get_changes_since_last_sync(
        &self,
        key: &DeviceKey,
        collections: &[CollectionName],
    ) -> Result<BTreeMap<CollectionName, Vec<ServerDocument>>, SyncError> {
        let state = self.ledger.load_state(key).await?;
        let collections: Vec<CollectionName> = if collections.is_empty() {
            self.schema
                .collection_names()
                .into_iter()
                .map(str::to_string)
                .collect()
        } else {
            collections.to_vec()
        };

        let mut changes = BTreeMap::new();
        for collection in collections {
            self.schema.get_collection(&collection)?;
            let since = state.since(&collection);
            let documents = self
                .fetch(self.store.changed_since(&collection, &key.user_id, since))
                .await?;
            self.refresh_cached(&documents);
            changes.insert(collection, documents);
        }
        Ok(changes)
    }

    fn refresh_cached(&self, documents: &[ServerDocument]) {
        let now = self.clock.now();
        let mut cache = self.cache.lock();
        for document in documents {
            let refresh = match cache.peek(&document.key()) {
                Some(record) => {
                    record.sync_status == SyncStatus::Synced && record.version <= document.version
                }
                None => true,
            };
            if refresh {
                cache.put(
                    VersionedRecord::from_server(document, now),
                    self.config.cache_ttl,
                    Origin::Remote,
                    now,
                );
            }
        }
    }

    /// Settle a conflicted record by taking one side.
    ///
    /// Only the pending operations of the device whose pass found the
    /// conflict are stale; other devices' operations stay pending for their
    /// own passes. `server` adopts the server copy and closes the stale
    /// operations without applying them. `local` rebases the stale changes
    /// onto the server copy as one fresh operation that outranks both
    /// versions.
    pub async fn resolve_conflict(
        &self,
        document: &DocumentKey,
        choice: ConflictChoice,
    ) -> Result<Resolution, SyncError> {
        let record = self
            .cache
            .lock()
            .peek(document)
            .cloned()
            .ok_or_else(|| EngineError::DocumentNotFound(document.document_id.clone()))?;
        let mut conflict = record
            .conflict()
            .ok_or_else(|| EngineError::NotInConflict(document.document_id.clone()))?;
        conflict.resolution = Some(choice);

        let device: Option<DeviceId> = record
            .conflicted_by
            .clone()
            .or_else(|| record.device_id.clone());
        let stale: Vec<SyncOperation> = self
            .ledger
            .pending_for_document(document)
            .await?
            .into_iter()
            .filter(|op| device.as_deref() == Some(op.device_id.as_str()))
            .collect();
        let now = self.clock.now();

        let resolution = match choice {
            ConflictChoice::Server => {
                let mut resolved = record.clone();
                resolved.adopt_server(now)?;
                let superseded = self.close_all(&stale, now).await?;
                self.replace_cached(document, Some(resolved.clone()), now);
                Resolution {
                    conflict,
                    record: Some(resolved),
                    operation: None,
                    superseded,
                }
            }
            ConflictChoice::Local => {
                let rebase = plan_local_resolution(&record, &stale)?;
                let device = device.ok_or_else(|| {
                    EngineError::InvalidOperation(format!(
                        "no device to attribute the resolution of {} to",
                        document
                    ))
                })?;

                let op = NewOperation::new(
                    record.owner_id.clone(),
                    device,
                    record.collection.clone(),
                    record.id.clone(),
                    rebase.change,
                    rebase.version,
                );
                self.schema.validate_operation(&op)?;
                let operation = self.ledger.record(op, now).await?;
                let superseded = self.close_all(&stale, now).await?;

                let resolved = rebase.data.map(|data| VersionedRecord {
                    data,
                    version: rebase.version,
                    device_id: Some(operation.device_id.clone()),
                    last_modified: now,
                    sync_status: SyncStatus::Pending,
                    server_version: None,
                    conflicted_by: None,
                    ..record.clone()
                });
                self.replace_cached(document, resolved.clone(), now);
                Resolution {
                    conflict,
                    record: resolved,
                    operation: Some(operation),
                    superseded,
                }
            }
        };

        tracing::info!(
            document = %document,
            choice = %choice,
            superseded = resolution.superseded.len(),
            "Conflict resolved"
        );
        Ok(resolution)
    }

    async fn close_all(
        &self,
        stale: &[SyncOperation],
        now: Timestamp,
    ) -> Result<Vec<OperationId>, SyncError> {
        let mut closed = Vec::with_capacity(stale.len());
        for op in stale {
            if self.ledger.mark_completed(&op.id, now).await? {
                closed.push(op.id.clone());
            }
        }
        Ok(closed)
    }

    fn replace_cached(&self, document: &DocumentKey, record: Option<VersionedRecord>, now: Timestamp) {
        let mut cache = self.cache.lock();
        match record {
            Some(record) => cache.restore(record, self.config.cache_ttl, now),
            None => {
                cache.delete(document);
            }
        }
    }

    /// Cached records of one owner, conflicts included.
    pub fn list_records(&self, owner_id: &str) -> Vec<VersionedRecord> {
        let now = self.clock.now();
        self.cache
            .lock()
            .list_by_owner(owner_id, now)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Cached record, expired or not.
    pub fn cached_record(&self, document: &DocumentKey) -> Option<VersionedRecord> {
        self.cache.lock().peek(document).cloned()
    }

    /// Drop expired cache entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        self.cache.lock().evict_expired(now)
    }
}

enum Staged {
    Record(VersionedRecord),
    /// A delete, carrying the version it was recorded at
    Removed(Version),
}

/// Compute the local record a mutation produces.
fn stage_local(
    op: &NewOperation,
    current: Option<VersionedRecord>,
    floor: Version,
    now: Timestamp,
) -> Result<Staged, EngineError> {
    match (&op.change, current) {
        (Change::Delete, Some(record)) => Ok(Staged::Removed(record.version.max(floor) + 1)),
        (Change::Delete, None) if floor > 0 => Ok(Staged::Removed(floor + 1)),
        (Change::Update { .. } | Change::Delete, None) => {
            Err(EngineError::DocumentNotFound(op.document_id.clone()))
        }
        (_, Some(mut record)) => {
            record.version = record.version.max(floor);
            record.apply_local(&op.change, now)?;
            record.device_id = Some(op.device_id.clone());
            Ok(Staged::Record(record))
        }
        (Change::Create { document }, None) => {
            let mut record = VersionedRecord::new_local(
                op.document_id.clone(),
                op.collection.clone(),
                op.user_id.clone(),
                document.clone(),
                now,
            )
            .with_device(op.device_id.clone());
            record.version = floor + 1;
            Ok(Staged::Record(record))
        }
    }
}
