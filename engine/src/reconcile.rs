//! Conflict detection and resolution.
//!
//! Version is the only conflict signal. For each pending operation the
//! detector compares the version the operation produced locally with the
//! version of the server copy:
//!
//! 1. No server copy: a create pushes a new document; anything else is
//!    orphaned (deleted server-side) and the local record is dropped.
//! 2. A server copy owned by someone else: the operation is rejected.
//! 3. Server version greater than local version: conflict. Nothing is
//!    applied and the operation stays pending until a manual choice is made.
//!    A create meeting an existing copy at the same version is a conflict
//!    too, unless it is a replay of exactly that copy.
//! 4. Otherwise the local change is pushed and the server copy takes the
//!    local version.
//!
//! Resolution is explicit: [`ConflictChoice::Server`] adopts the server copy,
//! [`ConflictChoice::Local`] rebases the stale local changes onto the server
//! copy as one fresh operation (see [`plan_local_resolution`]).

use crate::{
    error::Result, Change, CollectionName, DocumentId, Error, Schema, ServerDocument,
    SyncOperation, Timestamp, Version, VersionedRecord,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Manual choice for a conflicted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictChoice {
    /// Keep the local changes and push them on top of the server copy
    Local,
    /// Discard the local changes and take the server copy
    Server,
}

impl fmt::Display for ConflictChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictChoice::Local => write!(f, "local"),
            ConflictChoice::Server => write!(f, "server"),
        }
    }
}

impl FromStr for ConflictChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(ConflictChoice::Local),
            "server" => Ok(ConflictChoice::Server),
            other => Err(Error::InvalidOperation(format!(
                "unknown conflict choice '{other}', expected 'local' or 'server'"
            ))),
        }
    }
}

/// A detected divergence between local and server versions of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// The conflicted document
    pub document_id: DocumentId,
    /// Its collection
    pub collection: CollectionName,
    /// Version known locally
    pub local_version: Version,
    /// Version found on the server
    pub remote_version: Version,
    /// Manual choice, once made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictChoice>,
}

/// What a sync pass should do with one pending operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// No server copy yet: create this document.
    Create(ServerDocument),
    /// Overwrite the server copy with this document.
    Update(ServerDocument),
    /// Delete the server copy.
    Remove,
    /// The server copy is gone: drop the local record, complete the operation.
    Orphaned,
    /// The server is ahead: flag the local record, leave the operation pending.
    Conflict {
        conflict: Conflict,
        server: ServerDocument,
    },
}

/// Compares pending operations against server copies.
pub struct ConflictDetector<'a> {
    schema: &'a Schema,
}

impl<'a> ConflictDetector<'a> {
    /// Create a detector validating against `schema`.
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Decide the outcome of `op` given the current server copy.
    ///
    /// `now` stamps the `updated_at` of any document to be written.
    pub fn detect(
        &self,
        op: &SyncOperation,
        server: Option<&ServerDocument>,
        now: Timestamp,
    ) -> Result<Decision> {
        op.validate()?;
        self.schema.validate_change(&op.collection, &op.change)?;

        let Some(server) = server else {
            return match &op.change {
                Change::Create { document } => Ok(Decision::Create(self.document_for(
                    op,
                    document.clone(),
                    now,
                )?)),
                Change::Update { .. } | Change::Delete => Ok(Decision::Orphaned),
            };
        };

        if server.owner_id != op.user_id {
            return Err(Error::NotOwner(op.document_id.clone()));
        }

        let behind = match &op.change {
            Change::Create { document } => {
                server.version > op.version
                    || (server.version == op.version && server.data != *document)
            }
            Change::Update { .. } | Change::Delete => server.version > op.version,
        };
        if behind {
            return Ok(Decision::Conflict {
                conflict: Conflict {
                    document_id: op.document_id.clone(),
                    collection: op.collection.clone(),
                    local_version: op.version,
                    remote_version: server.version,
                    resolution: None,
                },
                server: server.clone(),
            });
        }

        match op.change.apply_to(Some(&server.data))? {
            Some(data) => Ok(Decision::Update(self.document_for(op, data, now)?)),
            None => Ok(Decision::Remove),
        }
    }

    fn document_for(
        &self,
        op: &SyncOperation,
        data: serde_json::Value,
        now: Timestamp,
    ) -> Result<ServerDocument> {
        self.schema.validate_document(&op.collection, &data)?;
        Ok(ServerDocument::new(
            op.document_id.clone(),
            op.collection.clone(),
            op.user_id.clone(),
            data,
            op.version,
            now,
        ))
    }
}

/// The fresh operation produced by resolving a conflict in favour of local.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRebase {
    /// Change to enqueue, relative to the server copy
    pub change: Change,
    /// Version the fresh operation carries
    pub version: Version,
    /// Local contents after rebasing; `None` when the result is a delete
    pub data: Option<serde_json::Value>,
}

/// Plan a `local` resolution for a conflicted record.
///
/// The stale pending changes are composed in replay order and rebased onto
/// the server copy, so fields the device never touched keep their server
/// values. Without stale operations the whole local document is pushed. The
/// fresh operation outranks both sides: `max(local, server) + 1`.
pub fn plan_local_resolution(
    record: &VersionedRecord,
    stale: &[SyncOperation],
) -> Result<LocalRebase> {
    if !record.is_conflicted() {
        return Err(Error::NotInConflict(record.id.clone()));
    }
    let server = record
        .server_version
        .as_ref()
        .ok_or_else(|| Error::NotInConflict(record.id.clone()))?;

    let mut ordered: Vec<&SyncOperation> = stale.iter().collect();
    ordered.sort_by(|a, b| a.replay_order(b));

    let mut changes = ordered.into_iter().map(|op| op.change.clone());
    let change = match changes.next() {
        Some(first) => changes.try_fold(first, |acc, next| acc.then(next))?,
        None => Change::create(record.data.clone()),
    };

    let data = change.apply_to(Some(&server.data))?;

    Ok(LocalRebase {
        change,
        version: record.version.max(server.version) + 1,
        data,
    })
}
