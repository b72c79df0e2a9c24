//! Sync orchestration: pending-operation passes, pulls, and conflict resolution.

mod coordinator;
mod events;
mod ledger;
mod locks;
mod scheduler;

pub use coordinator::{CoordinatorConfig, LocalSave, Resolution, SyncCoordinator};
pub use events::{EventSink, NoopSink, SyncEvent};
pub use ledger::{LedgerError, MemoryLedger, SyncLedger};
pub use locks::{DeviceGuard, DeviceLocks, LockPolicy};
pub use scheduler::{run_scheduled_passes, spawn_periodic_sync};

use larder_engine::DeviceKey;

use crate::store::StoreError;

/// Errors raised by sync entry points.
///
/// Per-operation failures never show up here; they are reported inside the
/// pass result. These are the failures that stop a call outright.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("a sync pass is already running for {0}")]
    Busy(DeviceKey),

    #[error("timed out waiting for the sync lock of {0}")]
    LockTimeout(DeviceKey),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] larder_engine::Error),
}
