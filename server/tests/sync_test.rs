//! Integration tests for sync passes, pulls and conflict resolution.
//!
//! Run against in-memory storage wrapped in a store that can be told to
//! fail, stall or drop off the network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use larder_engine::{
    Change, Clock, ConflictChoice, DeviceKey, DocumentKey, Error, ErrorKind, ManualClock,
    NewOperation, OperationStatus, Patch, ServerDocument, SyncOperation, SyncResult, SyncStatus,
    Timestamp,
};
use larder_server::schema::default_schema;
use larder_server::store::{DocumentStore, MemoryDocumentStore, StoreError};
use larder_server::sync::{
    run_scheduled_passes, CoordinatorConfig, EventSink, LockPolicy, MemoryLedger, SyncCoordinator,
    SyncError, SyncEvent, SyncLedger,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const START: Timestamp = 1_706_745_600_000;

/// Memory store with injectable faults.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryDocumentStore,
    /// Documents whose calls fail with a backend error
    failing: Mutex<HashSet<String>>,
    /// Documents whose calls stall first
    slow: Mutex<HashMap<String, Duration>>,
    unreachable: AtomicBool,
}

impl FaultyStore {
    fn fail(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    fn stall(&self, id: &str, delay: Duration) {
        self.slow.lock().insert(id.to_string(), delay);
    }

    fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    async fn gate(&self, id: &str) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        let delay = self.slow.lock().get(id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(id) {
            return Err(StoreError::Backend(format!("write rejected for {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn find(&self, collection: &str, id: &str) -> Result<Option<ServerDocument>, StoreError> {
        self.gate(id).await?;
        self.inner.find(collection, id).await
    }

    async fn create(&self, document: &ServerDocument) -> Result<(), StoreError> {
        self.gate(&document.id).await?;
        self.inner.create(document).await
    }

    async fn update(&self, document: &ServerDocument) -> Result<(), StoreError> {
        self.gate(&document.id).await?;
        self.inner.update(document).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        self.gate(id).await?;
        self.inner.delete(collection, id).await
    }

    async fn changed_since(
        &self,
        collection: &str,
        owner_id: &str,
        since: Timestamp,
    ) -> Result<Vec<ServerDocument>, StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.changed_since(collection, owner_id, since).await
    }
}

/// Collects published events.
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl EventSink for RecordingSink {
    fn publish(&self, event: &SyncEvent) -> usize {
        self.events.lock().push(event.clone());
        1
    }
}

struct Harness {
    store: Arc<FaultyStore>,
    ledger: Arc<MemoryLedger>,
    clock: Arc<ManualClock>,
    coordinator: Arc<SyncCoordinator>,
}

fn harness_with(config: CoordinatorConfig) -> Harness {
    let store = Arc::new(FaultyStore::default());
    let ledger = Arc::new(MemoryLedger::new());
    let clock = Arc::new(ManualClock::new(START));
    let coordinator = Arc::new(SyncCoordinator::new(
        store.clone(),
        ledger.clone(),
        clock.clone(),
        default_schema(),
        config,
    ));
    Harness {
        store,
        ledger,
        clock,
        coordinator,
    }
}

fn harness() -> Harness {
    harness_with(CoordinatorConfig {
        operation_timeout: Duration::from_millis(500),
        lock_policy: LockPolicy::Wait(Duration::from_secs(2)),
        cache_ttl: None,
    })
}

fn phone() -> DeviceKey {
    DeviceKey::new("u1", "phone")
}

fn tablet() -> DeviceKey {
    DeviceKey::new("u1", "tablet")
}

/// A recipe of u1.
fn doc(id: &str) -> DocumentKey {
    DocumentKey::new("u1", "recipes", id)
}

fn set(field: &str, value: Value) -> Change {
    Change::update(Patch::new().set(field, value))
}

impl Harness {
    async fn save(&self, key: &DeviceKey, id: &str, change: Change) -> larder_server::sync::LocalSave {
        self.clock.advance(10);
        self.coordinator
            .save_local(key, "recipes", id, change)
            .await
            .unwrap()
    }

    async fn create(&self, id: &str, title: &str) -> SyncOperation {
        self.save(&phone(), id, Change::create(json!({ "title": title })))
            .await
            .operation
    }

    async fn pass(&self) -> SyncResult {
        self.pass_for(&phone()).await
    }

    async fn pass_for(&self, key: &DeviceKey) -> SyncResult {
        self.clock.advance(10);
        self.coordinator
            .sync_pending(key, &CancellationToken::new())
            .await
            .unwrap()
    }

    /// Another client writes the server copy directly.
    fn external_write(&self, id: &str, data: Value, version: u64) {
        self.store.inner.put(ServerDocument::new(
            id,
            "recipes",
            "u1",
            data,
            version,
            self.clock.now(),
        ));
    }

    async fn status_of(&self, op_id: &str) -> OperationStatus {
        self.ledger.get(op_id).await.unwrap().unwrap().status
    }
}

#[tokio::test]
async fn test_offline_edits_push_as_one_pass() {
    let h = harness();
    h.create("r1", "Pasta").await;
    assert_eq!(h.pass().await.operations.completed, 1);
    assert_eq!(h.store.inner.get("recipes", "r1").unwrap().version, 1);

    h.clock.advance(60_000);
    h.save(&phone(), "r1", set("servings", json!(2))).await;
    let latest = h
        .save(&phone(), "r1", set("title", json!("Pasta al forno")))
        .await;
    let record = latest.record.unwrap();
    assert_eq!(record.version, 3);
    assert_eq!(record.sync_status, SyncStatus::Pending);

    let result = h.pass().await;
    assert!(result.success);
    assert_eq!(result.operations.completed, 2);
    assert!(result.conflicts.is_empty());

    let server = h.store.inner.get("recipes", "r1").unwrap();
    assert_eq!(server.version, 3);
    assert_eq!(server.data, json!({"title": "Pasta al forno", "servings": 2}));

    let cached = h.coordinator.cached_record(&doc("r1")).unwrap();
    assert_eq!(cached.sync_status, SyncStatus::Synced);
    assert_eq!(cached.version, 3);
    assert!(cached.last_synced.is_some());
}

#[tokio::test]
async fn test_versions_grow_by_one_across_passes() {
    let h = harness();
    h.create("r1", "Soup").await;
    let mut last = None;
    for i in 1..=5 {
        last = Some(h.save(&phone(), "r1", set("servings", json!(i))).await);
        if i % 2 == 0 {
            assert!(h.pass().await.success);
        }
    }

    let last = last.unwrap();
    assert_eq!(last.operation.version, 6);
    assert_eq!(last.record.unwrap().version, 6);

    h.pass().await;
    assert_eq!(h.store.inner.get("recipes", "r1").unwrap().version, 6);
    assert_eq!(h.coordinator.cached_record(&doc("r1")).unwrap().version, 6);
}

#[tokio::test]
async fn test_update_of_uncached_document_starts_from_server_copy() {
    let h = harness();
    h.external_write("r7", json!({"title": "Shared curry"}), 3);

    let saved = h.save(&phone(), "r7", set("servings", json!(2))).await;
    let record = saved.record.unwrap();
    assert_eq!(record.version, 4);
    assert_eq!(record.data, json!({"title": "Shared curry", "servings": 2}));

    assert!(h.pass().await.success);
    assert_eq!(h.store.inner.get("recipes", "r7").unwrap().version, 4);
}

#[tokio::test]
async fn test_update_of_unknown_document_is_rejected() {
    let h = harness();
    let err = h
        .coordinator
        .save_local(&phone(), "recipes", "ghost", set("title", json!("?")))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Engine(Error::DocumentNotFound(_))));
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_invalid_document_is_rejected_before_recording() {
    let h = harness();
    let err = h
        .coordinator
        .save_local(&phone(), "recipes", "r1", Change::create(json!({"servings": 2})))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Engine(Error::MissingRequiredField(_))));
    assert!(h.coordinator.cached_record(&doc("r1")).is_none());
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_conflict_leaves_server_and_operation_untouched() {
    let h = harness();
    h.create("r1", "Pasta").await;
    h.pass().await;
    let cursor_before = *h
        .ledger
        .load_state(&phone())
        .await
        .unwrap()
        .cursor("recipes")
        .unwrap();

    h.clock.advance(60_000);
    let stale = h.save(&phone(), "r1", set("servings", json!(4))).await.operation;
    h.external_write("r1", json!({"title": "Server pasta"}), 5);

    let result = h.pass().await;
    assert!(result.success);
    assert_eq!(result.operations.conflicted, 1);
    assert_eq!(result.operations.completed, 0);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].local_version, 2);
    assert_eq!(result.conflicts[0].remote_version, 5);

    let server = h.store.inner.get("recipes", "r1").unwrap();
    assert_eq!(server.version, 5);
    assert_eq!(server.data, json!({"title": "Server pasta"}));

    let record = h.coordinator.cached_record(&doc("r1")).unwrap();
    assert_eq!(record.sync_status, SyncStatus::Conflict);
    assert_eq!(record.server_version.as_ref().unwrap().version, 5);

    assert_eq!(h.status_of(&stale.id).await, OperationStatus::Pending);
    let state = h.ledger.load_state(&phone()).await.unwrap();
    assert_eq!(state.cursor("recipes"), Some(&cursor_before));
}

#[tokio::test]
async fn test_edits_after_a_conflict_wait_for_resolution() {
    let h = harness();
    h.create("r1", "Pasta").await;
    h.pass().await;

    h.save(&phone(), "r1", set("servings", json!(2))).await;
    h.save(&phone(), "r1", set("servings", json!(3))).await;
    h.create("r2", "Salad").await;
    h.external_write("r1", json!({"title": "Server pasta"}), 5);

    let result = h.pass().await;
    assert_eq!(result.operations.total, 3);
    assert_eq!(result.operations.conflicted, 1);
    assert_eq!(result.operations.skipped, 1);
    assert_eq!(result.operations.completed, 1);

    let pending = h.coordinator.pending_operations(&phone()).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|op| op.document_id == "r1"));
    assert!(h.store.inner.get("recipes", "r2").is_some());
}

#[tokio::test]
async fn test_resolve_with_server_copy() {
    let h = harness();
    h.create("r1", "Pasta").await;
    h.pass().await;
    let stale = h.save(&phone(), "r1", set("servings", json!(4))).await.operation;
    h.external_write("r1", json!({"title": "Server pasta"}), 5);
    h.pass().await;

    let resolution = h
        .coordinator
        .resolve_conflict(&doc("r1"), ConflictChoice::Server)
        .await
        .unwrap();

    assert_eq!(resolution.conflict.resolution, Some(ConflictChoice::Server));
    assert_eq!(resolution.superseded, vec![stale.id.clone()]);
    assert!(resolution.operation.is_none());

    let record = resolution.record.unwrap();
    assert_eq!(record.version, 5);
    assert_eq!(record.data, json!({"title": "Server pasta"}));
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert!(record.server_version.is_none());

    assert_eq!(h.status_of(&stale.id).await, OperationStatus::Completed);
    assert_eq!(h.pass().await.operations.total, 0);
    assert_eq!(h.store.inner.get("recipes", "r1").unwrap().version, 5);
}

#[tokio::test]
async fn test_resolve_with_local_changes_rebases_onto_server() {
    let h = harness();
    h.create("r1", "Pasta").await;
    h.pass().await;
    let stale = h.save(&phone(), "r1", set("servings", json!(4))).await.operation;
    h.external_write("r1", json!({"title": "Server pasta", "rating": 4.5}), 5);
    h.pass().await;

    let resolution = h
        .coordinator
        .resolve_conflict(&doc("r1"), ConflictChoice::Local)
        .await
        .unwrap();

    let fresh = resolution.operation.unwrap();
    assert_eq!(fresh.version, 6);
    assert_eq!(fresh.device_id, "phone");
    assert_eq!(resolution.superseded, vec![stale.id.clone()]);

    let record = resolution.record.unwrap();
    assert_eq!(record.version, 6);
    assert_eq!(record.sync_status, SyncStatus::Pending);
    assert_eq!(
        record.data,
        json!({"title": "Server pasta", "rating": 4.5, "servings": 4})
    );

    let result = h.pass().await;
    assert_eq!(result.operations.completed, 1);
    let server = h.store.inner.get("recipes", "r1").unwrap();
    assert_eq!(server.version, 6);
    assert_eq!(
        server.data,
        json!({"title": "Server pasta", "rating": 4.5, "servings": 4})
    );
    assert_eq!(
        h.coordinator.cached_record(&doc("r1")).unwrap().sync_status,
        SyncStatus::Synced
    );
}

#[tokio::test]
async fn test_resolution_leaves_other_devices_pending() {
    let h = harness();
    h.create("r1", "Pasta").await;
    h.pass().await;
    let stale = h.save(&phone(), "r1", set("servings", json!(4))).await.operation;
    h.external_write("r1", json!({"title": "Server pasta"}), 5);
    h.pass().await;

    // The tablet edits the same recipe before the phone's conflict is settled.
    let theirs = h
        .coordinator
        .record_operation(NewOperation::new(
            "u1",
            "tablet",
            "recipes",
            "r1",
            set("rating", json!(5)),
            7,
        ))
        .await
        .unwrap();

    let resolution = h
        .coordinator
        .resolve_conflict(&doc("r1"), ConflictChoice::Server)
        .await
        .unwrap();
    assert_eq!(resolution.superseded, vec![stale.id.clone()]);
    assert_eq!(h.status_of(&stale.id).await, OperationStatus::Completed);
    assert_eq!(h.status_of(&theirs.id).await, OperationStatus::Pending);

    let result = h.pass_for(&tablet()).await;
    assert_eq!(result.operations.completed, 1);
    let server = h.store.inner.get("recipes", "r1").unwrap();
    assert_eq!(server.version, 7);
    assert_eq!(server.data, json!({"title": "Server pasta", "rating": 5}));
}

#[tokio::test]
async fn test_local_resolution_rebases_only_the_conflicting_device() {
    let h = harness();
    h.create("r1", "Pasta").await;
    h.pass().await;
    let stale = h.save(&phone(), "r1", set("servings", json!(4))).await.operation;
    h.external_write("r1", json!({"title": "Server pasta"}), 5);
    h.pass().await;

    let theirs = h
        .coordinator
        .record_operation(NewOperation::new(
            "u1",
            "tablet",
            "recipes",
            "r1",
            set("rating", json!(5)),
            9,
        ))
        .await
        .unwrap();

    let resolution = h
        .coordinator
        .resolve_conflict(&doc("r1"), ConflictChoice::Local)
        .await
        .unwrap();
    let fresh = resolution.operation.unwrap();
    assert_eq!(fresh.device_id, "phone");
    assert_eq!(fresh.change, set("servings", json!(4)));
    assert_eq!(resolution.superseded, vec![stale.id.clone()]);
    assert_eq!(h.status_of(&theirs.id).await, OperationStatus::Pending);

    assert_eq!(h.pass().await.operations.completed, 1);
    assert_eq!(h.pass_for(&tablet()).await.operations.completed, 1);
    let server = h.store.inner.get("recipes", "r1").unwrap();
    assert_eq!(server.version, 9);
    assert_eq!(
        server.data,
        json!({"title": "Server pasta", "servings": 4, "rating": 5})
    );
}

#[tokio::test]
async fn test_another_users_document_is_never_overwritten() {
    let h = harness();
    h.create("r1", "Pasta").await;
    h.pass().await;
    let intruder = DeviceKey::new("u2", "laptop");

    let err = h
        .coordinator
        .save_local(&intruder, "recipes", "r1", Change::create(json!({"title": "Not yours"})))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(Error::NotOwner(_))));
    let err = h
        .coordinator
        .save_local(&intruder, "recipes", "r1", set("title", json!("Not yours")))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(Error::NotOwner(_))));

    let mine = h.coordinator.cached_record(&doc("r1")).unwrap();
    assert_eq!(mine.owner_id, "u1");
    assert_eq!(mine.data, json!({"title": "Pasta"}));
    assert!(h
        .coordinator
        .cached_record(&DocumentKey::new("u2", "recipes", "r1"))
        .is_none());

    // Operations sent straight from the other user's log are refused per operation.
    let op = SyncOperation::from_new(
        NewOperation::new(
            "u2",
            "laptop",
            "recipes",
            "r1",
            Change::create(json!({"title": "Not yours"})),
            1,
        ),
        "u2-op-1",
        START,
    );
    let result = h.coordinator.sync_changes(&intruder, vec![op]).await.unwrap();
    assert_eq!(result.operations.completed, 0);
    assert_eq!(result.operations.failed, 1);
    assert_eq!(result.errors.unwrap()[0].kind, ErrorKind::Validation);
    assert_eq!(h.status_of("u2-op-1").await, OperationStatus::Failed);

    let server = h.store.inner.get("recipes", "r1").unwrap();
    assert_eq!(server.owner_id, "u1");
    assert_eq!(server.data, json!({"title": "Pasta"}));
    assert_eq!(server.version, 1);
    assert_eq!(h.coordinator.list_records("u1")[0].data, json!({"title": "Pasta"}));
}

#[tokio::test]
async fn test_create_over_existing_document_is_refused() {
    let h = harness();
    h.create("r1", "Pasta").await;
    let err = h
        .coordinator
        .save_local(&tablet(), "recipes", "r1", Change::create(json!({"title": "Soup"})))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(Error::DocumentExists(_))));

    h.external_write("r5", json!({"title": "Shared curry"}), 2);
    let err = h
        .coordinator
        .save_local(&phone(), "recipes", "r5", Change::create(json!({"title": "Soup"})))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(Error::DocumentExists(_))));

    // A device that created the same id offline gets a conflict, not an overwrite.
    let op = SyncOperation::from_new(
        NewOperation::new(
            "u1",
            "tablet",
            "recipes",
            "r5",
            Change::create(json!({"title": "Soup"})),
            2,
        ),
        "tablet-op-1",
        START,
    );
    let result = h.coordinator.sync_changes(&tablet(), vec![op]).await.unwrap();
    assert_eq!(result.operations.conflicted, 1);
    assert_eq!(h.store.inner.get("recipes", "r5").unwrap().data["title"], "Shared curry");
    assert_eq!(h.status_of("tablet-op-1").await, OperationStatus::Pending);
    assert_eq!(
        h.coordinator.cached_record(&doc("r5")).unwrap().conflicted_by.as_deref(),
        Some("tablet")
    );
}

#[tokio::test]
async fn test_evicted_conflict_keeps_its_operation() {
    let h = harness_with(CoordinatorConfig {
        operation_timeout: Duration::from_millis(500),
        lock_policy: LockPolicy::Wait(Duration::from_secs(2)),
        cache_ttl: Some(Duration::from_secs(60)),
    });
    h.create("r1", "Pasta").await;
    h.pass().await;
    let stale = h.save(&phone(), "r1", set("servings", json!(4))).await.operation;
    h.external_write("r1", json!({"title": "Server pasta"}), 5);
    assert_eq!(h.pass().await.operations.conflicted, 1);

    h.clock.advance(120_000);
    assert_eq!(h.coordinator.evict_expired(), 1);
    assert!(h.coordinator.cached_record(&doc("r1")).is_none());
    assert_eq!(h.status_of(&stale.id).await, OperationStatus::Pending);

    // Nothing to resolve until a pass looks at the document again.
    let err = h
        .coordinator
        .resolve_conflict(&doc("r1"), ConflictChoice::Server)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(Error::DocumentNotFound(_))));

    let result = h.pass().await;
    assert_eq!(result.operations.conflicted, 1);
    let record = h.coordinator.cached_record(&doc("r1")).unwrap();
    assert_eq!(record.sync_status, SyncStatus::Conflict);
    assert_eq!(record.data, json!({"title": "Server pasta", "servings": 4}));

    let resolution = h
        .coordinator
        .resolve_conflict(&doc("r1"), ConflictChoice::Local)
        .await
        .unwrap();
    assert_eq!(resolution.superseded, vec![stale.id.clone()]);
    assert_eq!(h.pass().await.operations.completed, 1);
    let server = h.store.inner.get("recipes", "r1").unwrap();
    assert_eq!(server.version, 6);
    assert_eq!(server.data, json!({"title": "Server pasta", "servings": 4}));
}

#[tokio::test]
async fn test_resolve_requires_a_conflict() {
    let h = harness();
    h.create("r1", "Pasta").await;

    let err = h
        .coordinator
        .resolve_conflict(&doc("r1"), ConflictChoice::Server)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(Error::NotInConflict(_))));

    let err = h
        .coordinator
        .resolve_conflict(&doc("missing"), ConflictChoice::Local)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(Error::DocumentNotFound(_))));
}

#[tokio::test]
async fn test_replayed_operations_are_applied_once() {
    let h = harness();
    let ops = vec![
        SyncOperation::from_new(
            NewOperation::new(
                "u1",
                "phone",
                "recipes",
                "r9",
                Change::create(json!({"title": "Stew"})),
                1,
            ),
            "client-op-1",
            START,
        ),
        SyncOperation::from_new(
            NewOperation::new("u1", "phone", "recipes", "r9", set("servings", json!(3)), 2),
            "client-op-2",
            START + 1,
        ),
    ];

    let first = h.coordinator.sync_changes(&phone(), ops.clone()).await.unwrap();
    assert_eq!(first.operations.completed, 2);
    let after_first = h.store.inner.get("recipes", "r9").unwrap();
    assert_eq!(after_first.version, 2);

    let second = h.coordinator.sync_changes(&phone(), ops).await.unwrap();
    assert_eq!(second.operations.total, 0);
    assert_eq!(h.store.inner.get("recipes", "r9").unwrap(), after_first);
    assert_eq!(h.ledger.len(), 2);
}

#[tokio::test]
async fn test_append_order_breaks_timestamp_ties() {
    let h = harness();
    h.external_write("r1", json!({"title": "Draft"}), 1);

    // Same timestamp; the id of the later operation sorts first.
    let ops = vec![
        SyncOperation::from_new(
            NewOperation::new("u1", "phone", "recipes", "r1", set("title", json!("A")), 2),
            "op-b",
            START,
        ),
        SyncOperation::from_new(
            NewOperation::new("u1", "phone", "recipes", "r1", set("title", json!("B")), 3),
            "op-a",
            START,
        ),
    ];

    let result = h.coordinator.sync_changes(&phone(), ops).await.unwrap();
    assert_eq!(result.operations.completed, 2);
    let server = h.store.inner.get("recipes", "r1").unwrap();
    assert_eq!(server.version, 3);
    assert_eq!(server.data["title"], "B");
}

#[tokio::test]
async fn test_operations_of_another_device_are_refused() {
    let h = harness();
    let op = SyncOperation::from_new(
        NewOperation::new(
            "u1",
            "tablet",
            "recipes",
            "r1",
            Change::create(json!({"title": "Stew"})),
            1,
        ),
        "op-1",
        START,
    );

    let err = h.coordinator.sync_changes(&phone(), vec![op]).await.unwrap_err();
    assert!(matches!(err, SyncError::Engine(Error::InvalidOperation(_))));
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_pass() {
    let h = harness();
    let mut ops = Vec::new();
    for i in 1..=5 {
        ops.push(h.create(&format!("r{}", i), "Dish").await);
    }
    h.store.fail("r3");

    let result = h.pass().await;
    assert!(!result.success);
    assert_eq!(result.operations.completed, 4);
    assert_eq!(result.operations.failed, 1);

    let errors = result.errors.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].document_id, "r3");
    assert_eq!(errors[0].kind, ErrorKind::Database);

    let failed = h.ledger.get(&ops[2].id).await.unwrap().unwrap();
    assert_eq!(failed.status, OperationStatus::Failed);
    assert!(failed.error.is_some());

    for i in [1, 2, 4, 5] {
        assert!(h.store.inner.get("recipes", &format!("r{}", i)).is_some());
    }
    assert!(h.coordinator.pending_operations(&phone()).await.unwrap().is_empty());

    let state = h.ledger.load_state(&phone()).await.unwrap();
    assert_eq!(state.cursor("recipes").unwrap().last_sync_timestamp, result.timestamp);
}

#[tokio::test]
async fn test_outage_keeps_everything_pending() {
    let h = harness();
    for id in ["r1", "r2", "r3"] {
        h.create(id, "Dish").await;
    }
    h.store.set_unreachable(true);

    let result = h.pass().await;
    assert!(!result.success);
    assert_eq!(result.operations.failed, 3);
    assert_eq!(result.operations.completed, 0);
    let errors = result.errors.unwrap();
    assert!(errors.iter().all(|e| e.kind == ErrorKind::Transport));

    assert_eq!(h.coordinator.pending_operations(&phone()).await.unwrap().len(), 3);
    let state = h.ledger.load_state(&phone()).await.unwrap();
    assert_eq!(state.last_sync_timestamp, 0);
    assert!(state.collections.is_empty());

    h.store.set_unreachable(false);
    let retry = h.pass().await;
    assert!(retry.success);
    assert_eq!(retry.operations.completed, 3);
}

#[tokio::test]
async fn test_slow_store_call_times_out() {
    let h = harness_with(CoordinatorConfig {
        operation_timeout: Duration::from_millis(50),
        lock_policy: LockPolicy::Reject,
        cache_ttl: None,
    });
    for id in ["r1", "r2", "r3"] {
        h.create(id, "Dish").await;
    }
    h.store.stall("r2", Duration::from_millis(300));

    let result = h.pass().await;
    assert_eq!(result.operations.completed, 2);
    assert_eq!(result.operations.failed, 1);
    let errors = result.errors.unwrap();
    assert_eq!(errors[0].document_id, "r2");
    assert_eq!(errors[0].kind, ErrorKind::Timeout);
    assert!(h.store.inner.get("recipes", "r2").is_none());
}

#[tokio::test]
async fn test_cancel_before_start_touches_nothing() {
    let h = harness();
    for id in ["r1", "r2", "r3"] {
        h.create(id, "Dish").await;
    }
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h.coordinator.sync_pending(&phone(), &cancel).await.unwrap();
    assert!(result.cancelled);
    assert_eq!(result.operations.skipped, 3);
    assert_eq!(result.operations.completed, 0);
    assert!(h.store.inner.is_empty());
    assert_eq!(h.coordinator.pending_operations(&phone()).await.unwrap().len(), 3);

    let state = h.ledger.load_state(&phone()).await.unwrap();
    assert!(state.cursor("recipes").is_none());
}

#[tokio::test]
async fn test_cancel_mid_pass_leaves_the_rest_pending() {
    let h = harness();
    for id in ["r1", "r2", "r3"] {
        h.create(id, "Dish").await;
    }
    h.store.stall("r1", Duration::from_millis(150));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let result = h.coordinator.sync_pending(&phone(), &cancel).await.unwrap();
    assert!(result.cancelled);
    assert_eq!(result.operations.completed, 1);
    assert_eq!(result.operations.skipped, 2);

    let pending = h.coordinator.pending_operations(&phone()).await.unwrap();
    let ids: Vec<&str> = pending.iter().map(|op| op.document_id.as_str()).collect();
    assert_eq!(ids, vec!["r2", "r3"]);
}

#[tokio::test]
async fn test_concurrent_pass_for_same_device_is_rejected() {
    let h = harness();
    h.create("r1", "Dish").await;
    h.store.stall("r1", Duration::from_millis(200));

    let coordinator = h.coordinator.clone();
    let running = tokio::spawn(async move {
        coordinator
            .sync_device(&phone(), LockPolicy::Reject, &CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.coordinator.is_syncing(&phone()));

    let err = h
        .coordinator
        .sync_device(&phone(), LockPolicy::Reject, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Busy(_)));

    let err = h
        .coordinator
        .sync_device(
            &phone(),
            LockPolicy::Wait(Duration::from_millis(20)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::LockTimeout(_)));

    // Other devices are not held up.
    let other = h
        .coordinator
        .sync_device(&tablet(), LockPolicy::Reject, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(other.operations.total, 0);

    let first = running.await.unwrap().unwrap();
    assert_eq!(first.operations.completed, 1);
    assert!(!h.coordinator.is_syncing(&phone()));
}

#[tokio::test]
async fn test_waiting_pass_runs_after_the_first() {
    let h = harness();
    h.create("r1", "Dish").await;
    h.store.stall("r1", Duration::from_millis(100));

    let coordinator = h.coordinator.clone();
    let running = tokio::spawn(async move {
        coordinator
            .sync_device(&phone(), LockPolicy::Reject, &CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let waited = h
        .coordinator
        .sync_device(
            &phone(),
            LockPolicy::Wait(Duration::from_secs(2)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(waited.operations.total, 0);
    assert_eq!(running.await.unwrap().unwrap().operations.completed, 1);
}

#[tokio::test]
async fn test_delete_removes_server_copy() {
    let h = harness();
    h.create("r1", "Dish").await;
    h.pass().await;

    let saved = h.save(&phone(), "r1", Change::Delete).await;
    assert!(saved.record.is_none());
    assert_eq!(saved.operation.version, 2);
    assert!(h.coordinator.cached_record(&doc("r1")).is_none());

    assert_eq!(h.pass().await.operations.completed, 1);
    assert!(h.store.inner.get("recipes", "r1").is_none());
}

#[tokio::test]
async fn test_update_of_document_deleted_elsewhere_is_dropped() {
    let h = harness();
    h.create("r1", "Dish").await;
    h.pass().await;
    let op = h.save(&phone(), "r1", set("servings", json!(2))).await.operation;
    h.store.inner.delete("recipes", "r1").await.unwrap();

    let result = h.pass().await;
    assert!(result.success);
    assert_eq!(result.operations.completed, 1);
    assert_eq!(h.status_of(&op.id).await, OperationStatus::Completed);
    assert!(h.coordinator.cached_record(&doc("r1")).is_none());
    assert!(h.store.inner.get("recipes", "r1").is_none());
}

#[tokio::test]
async fn test_pull_refreshes_synced_records_only() {
    let h = harness();
    h.create("r1", "Pasta").await;
    h.create("r2", "Salad").await;
    h.pass().await;
    let state_before = h.ledger.load_state(&phone()).await.unwrap();

    h.clock.advance(60_000);
    h.save(&phone(), "r2", set("servings", json!(2))).await;
    h.external_write("r1", json!({"title": "Pasta v4"}), 4);
    h.external_write("r2", json!({"title": "Salad v6"}), 6);
    h.external_write("r3", json!({"title": "From the tablet"}), 1);
    h.store.inner.put(ServerDocument::new(
        "x1",
        "recipes",
        "u2",
        json!({"title": "Someone else's"}),
        1,
        h.clock.now(),
    ));

    let changes = h
        .coordinator
        .get_changes_since_last_sync(&phone(), &["recipes".to_string()])
        .await
        .unwrap();
    let ids: Vec<&str> = changes["recipes"].iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["r1", "r2", "r3"]);

    let r1 = h.coordinator.cached_record(&doc("r1")).unwrap();
    assert_eq!(r1.version, 4);
    assert_eq!(r1.sync_status, SyncStatus::Synced);
    assert_eq!(r1.data["title"], "Pasta v4");

    let r2 = h.coordinator.cached_record(&doc("r2")).unwrap();
    assert_eq!(r2.version, 2);
    assert_eq!(r2.sync_status, SyncStatus::Pending);

    assert_eq!(h.coordinator.cached_record(&doc("r3")).unwrap().version, 1);
    assert!(h.coordinator.cached_record(&doc("x1")).is_none());

    assert_eq!(h.ledger.load_state(&phone()).await.unwrap(), state_before);
}

#[tokio::test]
async fn test_pull_defaults_to_every_collection() {
    let h = harness();
    let changes = h
        .coordinator
        .get_changes_since_last_sync(&phone(), &[])
        .await
        .unwrap();
    let collections: Vec<&str> = changes.keys().map(String::as_str).collect();
    assert_eq!(
        collections,
        vec!["collections", "meal_plans", "recipes", "shopping_lists"]
    );

    let err = h
        .coordinator
        .get_changes_since_last_sync(&phone(), &["pantry".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(Error::CollectionNotFound(_))));
}

#[tokio::test]
async fn test_push_moves_the_pull_cursor() {
    let h = harness();
    h.create("r1", "Pasta").await;
    h.pass().await;

    h.clock.advance(1_000);
    h.external_write("r3", json!({"title": "From the tablet"}), 1);
    h.clock.advance(1_000);
    h.save(&phone(), "r1", set("servings", json!(2))).await;
    let result = h.pass().await;
    assert_eq!(result.operations.completed, 1);

    // One cursor per device and collection: the push skipped past r3.
    let collections = ["recipes".to_string()];
    let changes = h
        .coordinator
        .get_changes_since_last_sync(&phone(), &collections)
        .await
        .unwrap();
    assert!(changes["recipes"].iter().all(|d| d.id != "r3"));

    let changes = h
        .coordinator
        .get_changes_since_last_sync(&tablet(), &collections)
        .await
        .unwrap();
    let ids: Vec<&str> = changes["recipes"].iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["r3", "r1"]);
}

#[tokio::test]
async fn test_scheduler_syncs_every_device_and_publishes() {
    let h = harness();
    h.create("r1", "Pasta").await;
    h.save(&tablet(), "r2", Change::create(json!({"title": "Salad"})))
        .await;
    let sink = RecordingSink::default();

    let ran = run_scheduled_passes(&h.coordinator, &sink, &CancellationToken::new()).await;
    assert_eq!(ran, 2);

    let mut devices: Vec<String> = sink
        .events
        .lock()
        .iter()
        .map(|e| e.device_id.clone())
        .collect();
    devices.sort();
    assert_eq!(devices, vec!["phone", "tablet"]);
    assert!(h.coordinator.devices_with_pending().await.unwrap().is_empty());

    // Nothing left to do, nothing to announce.
    assert_eq!(
        run_scheduled_passes(&h.coordinator, &sink, &CancellationToken::new()).await,
        0
    );
    assert_eq!(sink.events.lock().len(), 2);
}
