//! Record types: the server copy of a document and the versioned local copy.

use crate::{
    error::Result, reconcile::Conflict, Change, CollectionName, DeviceId, DocumentId, Error,
    Timestamp, UserId, Version,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a document within one user's data.
///
/// The same document id may exist in two collections, or be claimed by two
/// users; the cache and the log never mix those up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentKey {
    pub owner_id: UserId,
    pub collection: CollectionName,
    pub document_id: DocumentId,
}

impl DocumentKey {
    pub fn new(
        owner_id: impl Into<UserId>,
        collection: impl Into<CollectionName>,
        document_id: impl Into<DocumentId>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            collection: collection.into(),
            document_id: document_id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner_id, self.collection, self.document_id)
    }
}

/// Where a cache write comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// A local mutation made on a device
    Local,
    /// A copy confirmed by, or received from, the server
    Remote,
}

/// Sync status of a locally cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local copy matches the server
    Synced,
    /// Local mutations await a sync pass
    Pending,
    /// The server moved ahead; needs a manual choice
    Conflict,
}

/// The server-of-record copy of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDocument {
    /// Document ID
    pub id: DocumentId,
    /// Collection the document lives in
    pub collection: CollectionName,
    /// Owning user
    pub owner_id: UserId,
    /// Document contents (JSON object)
    pub data: serde_json::Value,
    /// Server-side version
    pub version: Version,
    /// Last write on the server (milliseconds since epoch)
    pub updated_at: Timestamp,
}

impl ServerDocument {
    /// Create a server document.
    pub fn new(
        id: impl Into<DocumentId>,
        collection: impl Into<CollectionName>,
        owner_id: impl Into<UserId>,
        data: serde_json::Value,
        version: Version,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            owner_id: owner_id.into(),
            data,
            version,
            updated_at,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.owner_id.clone(), self.collection.clone(), self.id.clone())
    }
}

/// A client-local copy of a document plus its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedRecord {
    /// Document ID
    pub id: DocumentId,
    /// Collection the document lives in
    pub collection: CollectionName,
    /// Owning user
    pub owner_id: UserId,
    /// Device that made the latest local mutation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    /// Local document contents
    pub data: serde_json::Value,
    /// Local version, starts at 1 and grows by one per local mutation
    pub version: Version,
    /// Last local modification
    pub last_modified: Timestamp,
    /// Sync status
    pub sync_status: SyncStatus,
    /// Last time the record was confirmed by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<Timestamp>,
    /// Server copy, present only while in conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<ServerDocument>,
    /// Device whose pass found the conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicted_by: Option<DeviceId>,
}

impl VersionedRecord {
    /// A record created by a local save. Starts at version 1, pending.
    pub fn new_local(
        id: impl Into<DocumentId>,
        collection: impl Into<CollectionName>,
        owner_id: impl Into<UserId>,
        data: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            owner_id: owner_id.into(),
            device_id: None,
            data,
            version: 1,
            last_modified: timestamp,
            sync_status: SyncStatus::Pending,
            last_synced: None,
            server_version: None,
            conflicted_by: None,
        }
    }

    /// A record mirroring a server document, already synced.
    pub fn from_server(document: &ServerDocument, timestamp: Timestamp) -> Self {
        Self {
            id: document.id.clone(),
            collection: document.collection.clone(),
            owner_id: document.owner_id.clone(),
            device_id: None,
            data: document.data.clone(),
            version: document.version,
            last_modified: document.updated_at,
            sync_status: SyncStatus::Synced,
            last_synced: Some(timestamp),
            server_version: None,
            conflicted_by: None,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.owner_id.clone(), self.collection.clone(), self.id.clone())
    }

    /// Builder-style: attribute the record to a device.
    pub fn with_device(mut self, device_id: impl Into<DeviceId>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Whether the record awaits a manual conflict choice.
    pub fn is_conflicted(&self) -> bool {
        self.sync_status == SyncStatus::Conflict
    }

    /// Apply a local create/update change: contents change, version + 1, pending.
    ///
    /// Deletes are not applied to a record; the cache drops it instead.
    pub fn apply_local(&mut self, change: &Change, timestamp: Timestamp) -> Result<()> {
        let data = change.apply_to(Some(&self.data))?.ok_or_else(|| {
            Error::InvalidOperation("delete changes remove the record instead".into())
        })?;
        self.data = data;
        self.version += 1;
        self.last_modified = timestamp;
        // A new local edit on a conflicted record keeps the conflict visible.
        if !self.is_conflicted() {
            self.sync_status = SyncStatus::Pending;
        }
        Ok(())
    }

    /// The server confirmed this record.
    pub fn mark_synced(&mut self, timestamp: Timestamp) {
        self.sync_status = SyncStatus::Synced;
        self.last_synced = Some(timestamp);
        self.server_version = None;
        self.conflicted_by = None;
    }

    /// A sync pass found the server ahead of this record.
    pub fn mark_conflict(&mut self, server: ServerDocument) {
        self.sync_status = SyncStatus::Conflict;
        self.server_version = Some(server);
    }

    /// Like [`mark_conflict`](Self::mark_conflict), remembering the device
    /// whose pending operations are stale.
    pub fn mark_conflict_from(&mut self, server: ServerDocument, device_id: impl Into<DeviceId>) {
        self.mark_conflict(server);
        self.conflicted_by = Some(device_id.into());
    }

    /// Replace local contents and version with the server copy held in conflict.
    pub fn adopt_server(&mut self, timestamp: Timestamp) -> Result<()> {
        if !self.is_conflicted() {
            return Err(Error::NotInConflict(self.id.clone()));
        }
        let server = self
            .server_version
            .take()
            .ok_or_else(|| Error::NotInConflict(self.id.clone()))?;
        self.data = server.data;
        self.version = self.version.max(server.version);
        self.last_modified = timestamp;
        self.mark_synced(timestamp);
        Ok(())
    }

    /// Describe the conflict this record is in, if any.
    pub fn conflict(&self) -> Option<Conflict> {
        if !self.is_conflicted() {
            return None;
        }
        self.server_version.as_ref().map(|server| Conflict {
            document_id: self.id.clone(),
            collection: self.collection.clone(),
            local_version: self.version,
            remote_version: server.version,
            resolution: None,
        })
    }
}
