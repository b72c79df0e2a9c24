//! Per-device sync cursors.

use crate::{CollectionName, DeviceId, Timestamp, UserId, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Identity of one device of one user. Sync passes are scoped to a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKey {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

impl DeviceKey {
    pub fn new(user_id: impl Into<UserId>, device_id: impl Into<DeviceId>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

/// How far a device has synced one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionCursor {
    pub last_sync_timestamp: Timestamp,
    /// Highest document version pushed for this collection
    pub version: Version,
}

/// Sync progress of one (user, device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub user_id: UserId,
    pub device_id: DeviceId,
    /// Time of the last pass that was not aborted
    pub last_sync_timestamp: Timestamp,
    #[serde(default)]
    pub collections: BTreeMap<CollectionName, CollectionCursor>,
}

impl SyncState {
    /// A device that never synced.
    pub fn new(user_id: impl Into<UserId>, device_id: impl Into<DeviceId>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            last_sync_timestamp: 0,
            collections: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.user_id.clone(), self.device_id.clone())
    }

    pub fn cursor(&self, collection: &str) -> Option<&CollectionCursor> {
        self.collections.get(collection)
    }

    /// Lower bound for pulling `collection`; 0 when it was never synced.
    pub fn since(&self, collection: &str) -> Timestamp {
        self.cursor(collection)
            .map(|c| c.last_sync_timestamp)
            .unwrap_or(0)
    }

    /// Advance the cursors of fully processed collections to `now`.
    ///
    /// `advances` maps each collection to the highest version completed in
    /// the pass. Cursor versions never go backwards.
    pub fn advance(&mut self, advances: &BTreeMap<CollectionName, Version>, now: Timestamp) {
        for (collection, version) in advances {
            let cursor = self.collections.entry(collection.clone()).or_default();
            cursor.last_sync_timestamp = cursor.last_sync_timestamp.max(now);
            cursor.version = cursor.version.max(*version);
        }
        self.last_sync_timestamp = self.last_sync_timestamp.max(now);
    }
}

/// In-memory map of sync states by device.
#[derive(Debug, Clone, Default)]
pub struct SyncStateTracker {
    states: HashMap<DeviceKey, SyncState>,
}

impl SyncStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&SyncState> {
        self.states.get(key)
    }

    /// The stored state, or a fresh one for a device that never synced.
    pub fn get_or_default(&self, key: &DeviceKey) -> SyncState {
        self.states
            .get(key)
            .cloned()
            .unwrap_or_else(|| SyncState::new(key.user_id.clone(), key.device_id.clone()))
    }

    pub fn upsert(&mut self, state: SyncState) {
        self.states.insert(state.key(), state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
