//! Per-device pass locks.
//!
//! At most one pass runs for a given (user, device) at a time. Passes for
//! different devices never contend.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use larder_engine::DeviceKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::SyncError;

/// What to do when a device already has a pass running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Queue behind the running pass, giving up after the duration.
    Wait(Duration),
    /// Fail immediately with [`SyncError::Busy`].
    Reject,
}

type LockMap = DashMap<DeviceKey, Arc<Mutex<()>>>;

/// Held for the duration of one pass.
///
/// Dropping it releases the device and forgets its lock when nobody else
/// is holding or waiting on it.
#[derive(Debug)]
pub struct DeviceGuard {
    key: DeviceKey,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DeviceGuard {
    pub fn key(&self) -> &DeviceKey {
        &self.key
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.guard.take();
        prune(&self.locks, &self.key);
    }
}

/// Forget the lock of `key` if only the map still refers to it.
fn prune(locks: &LockMap, key: &DeviceKey) {
    locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
}

#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: Arc<LockMap>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key` under `policy`.
    pub async fn acquire(&self, key: &DeviceKey, policy: LockPolicy) -> Result<DeviceGuard, SyncError> {
        // Clone the Arc out so the map shard is not held while waiting.
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let acquired = match policy {
            LockPolicy::Reject => lock
                .try_lock_owned()
                .map_err(|_| SyncError::Busy(key.clone())),
            LockPolicy::Wait(limit) => tokio::time::timeout(limit, lock.lock_owned())
                .await
                .map_err(|_| SyncError::LockTimeout(key.clone())),
        };

        match acquired {
            Ok(guard) => Ok(DeviceGuard {
                key: key.clone(),
                locks: self.locks.clone(),
                guard: Some(guard),
            }),
            Err(err) => {
                prune(&self.locks, key);
                Err(err)
            }
        }
    }

    /// Whether a pass currently holds the lock for `key`.
    pub fn is_locked(&self, key: &DeviceKey) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Devices with a lock entry: held, or waited on.
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}
