//! # Larder Engine
//!
//! Deterministic sync primitives for the Larder recipe app.
//!
//! Users edit the same recipes, meal plans and shopping lists from several
//! devices, often offline. This crate holds the logic that lets those edits
//! reach the server of record without silently losing data. It performs no
//! IO: the server crate drives it against real storage.
//!
//! ## Core Concepts
//!
//! ### Versioned records
//!
//! A [`VersionedRecord`] is the client-local copy of a document. Its version
//! starts at 1 and grows by exactly one per local mutation. Its
//! [`SyncStatus`] is `synced`, `pending` or `conflict`. The
//! [`RecordCache`] stores records with an optional advisory TTL.
//!
//! ### Operations
//!
//! Every local mutation is recorded as a [`SyncOperation`] carrying a typed
//! [`Change`]: `create` with a full document, `update` with a field
//! [`Patch`], or `delete`. The [`OperationLog`] is append-only and orders
//! each device's pending operations by creation time.
//!
//! ### Conflicts
//!
//! Version is the only conflict signal. The [`ConflictDetector`] turns each
//! pending operation plus the current server copy into a [`Decision`]. A
//! server copy ahead of the local version becomes a [`Conflict`] that waits
//! for an explicit [`ConflictChoice`].
//!
//! ### Cursors and reports
//!
//! [`SyncState`] records, per collection, how far a device has synced. A
//! [`PassTally`] accumulates the outcome of one pass and decides which
//! cursors may advance; it finishes into a [`SyncResult`].
//!
//! ## Quick Start
//!
//! ```rust
//! use larder_engine::{
//!     Change, CollectionSchema, ConflictDetector, Decision, DeviceKey, FieldDef,
//!     FieldType, NewOperation, OperationLog, Patch, Schema, ServerDocument,
//! };
//! use serde_json::json;
//!
//! let schema = Schema::new(1).with_collection(CollectionSchema::new(
//!     "recipes",
//!     vec![FieldDef::required("title", FieldType::String)],
//! ));
//!
//! // A device edited a recipe twice while offline.
//! let mut log = OperationLog::new();
//! log.record(
//!     NewOperation::new("user-1", "phone", "recipes", "recipe-1",
//!         Change::update(Patch::new().set("title", json!("Pasta al limone"))), 3),
//!     1_706_745_600_000,
//! ).unwrap();
//!
//! let server = ServerDocument::new(
//!     "recipe-1", "recipes", "user-1", json!({"title": "Pasta"}), 1, 1_706_745_000_000,
//! );
//!
//! let detector = ConflictDetector::new(&schema);
//! let pending = log.pending(&DeviceKey::new("user-1", "phone"));
//! match detector.detect(&pending[0], Some(&server), 1_706_745_700_000).unwrap() {
//!     Decision::Update(doc) => assert_eq!(doc.version, 3),
//!     other => panic!("unexpected decision: {other:?}"),
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod error;
pub mod operation;
pub mod oplog;
pub mod reconcile;
pub mod record;
pub mod report;
pub mod schema;
pub mod state;

// Re-export main types at crate root
pub use cache::RecordCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, ErrorKind};
pub use operation::{
    Change, NewOperation, OperationStatus, OperationType, Patch, SyncOperation,
};
pub use oplog::{AppendOutcome, OperationLog};
pub use reconcile::{
    plan_local_resolution, Conflict, ConflictChoice, ConflictDetector, Decision, LocalRebase,
};
pub use record::{DocumentKey, Origin, ServerDocument, SyncStatus, VersionedRecord};
pub use report::{OperationCounts, OperationError, PassTally, SyncResult};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};
pub use state::{CollectionCursor, DeviceKey, SyncState, SyncStateTracker};

/// Type aliases for clarity
pub type DocumentId = String;
pub type CollectionName = String;
pub type UserId = String;
pub type DeviceId = String;
pub type OperationId = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
