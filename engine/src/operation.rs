//! Operation types for expressing changes.
//!
//! Changes are expressed as operations, not direct mutations. A device records
//! every local mutation as a [`SyncOperation`] which stays pending until a sync
//! pass applies it to the server of record.

use crate::{
    error::Result, CollectionName, DeviceId, DeviceKey, DocumentId, DocumentKey, Error, OperationId,
    Timestamp, UserId, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A field-level patch over a JSON object document.
///
/// `set` assigns values, `unset` removes fields. A field never appears in
/// both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// Fields to assign
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Value>,
    /// Fields to remove
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unset: BTreeSet<String>,
}

impl Patch {
    /// Create an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: assign a field.
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        let field = field.into();
        self.unset.remove(&field);
        self.set.insert(field, value);
        self
    }

    /// Builder-style: remove a field.
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.set.remove(&field);
        self.unset.insert(field);
        self
    }

    /// True when the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Names of every field this patch touches.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.set
            .keys()
            .map(String::as_str)
            .chain(self.unset.iter().map(String::as_str))
    }

    /// Check the patch is well formed.
    pub fn validate(&self) -> Result<()> {
        for field in self.fields() {
            if field.is_empty() {
                return Err(Error::InvalidOperation("patch field name is empty".into()));
            }
        }
        if let Some(field) = self.set.keys().find(|f| self.unset.contains(*f)) {
            return Err(Error::InvalidOperation(format!(
                "field '{field}' is both set and unset"
            )));
        }
        Ok(())
    }

    /// Apply the patch to an object document, returning the patched copy.
    pub fn apply_to(&self, document: &Value) -> Result<Value> {
        let mut object = as_object(document)?.clone();
        for field in &self.unset {
            object.remove(field);
        }
        for (field, value) in &self.set {
            object.insert(field.clone(), value.clone());
        }
        Ok(Value::Object(object))
    }

    /// Compose two patches. Fields touched by `later` take its outcome.
    pub fn then(mut self, later: &Patch) -> Patch {
        for field in &later.unset {
            self.set.remove(field);
            self.unset.insert(field.clone());
        }
        for (field, value) in &later.set {
            self.unset.remove(field);
            self.set.insert(field.clone(), value.clone());
        }
        self
    }

    /// Derive the patch that turns `from` into `to`.
    pub fn diff(from: &Value, to: &Value) -> Result<Patch> {
        let from = as_object(from)?;
        let to = as_object(to)?;

        let mut patch = Patch::new();
        for (field, value) in to {
            if from.get(field) != Some(value) {
                patch.set.insert(field.clone(), value.clone());
            }
        }
        for field in from.keys() {
            if !to.contains_key(field) {
                patch.unset.insert(field.clone());
            }
        }
        Ok(patch)
    }
}

fn as_object(document: &Value) -> Result<&Map<String, Value>> {
    document
        .as_object()
        .ok_or_else(|| Error::InvalidDocument("document must be a JSON object".into()))
}

/// Kind of mutation an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Create => write!(f, "create"),
            OperationType::Update => write!(f, "update"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

/// The payload of an operation, keyed by operation type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Change {
    /// Create a document with the given initial contents.
    Create { document: Value },
    /// Patch an existing document.
    Update { patch: Patch },
    /// Delete the document.
    Delete,
}

impl Change {
    /// Shorthand for a create change.
    pub fn create(document: Value) -> Self {
        Change::Create { document }
    }

    /// Shorthand for an update change.
    pub fn update(patch: Patch) -> Self {
        Change::Update { patch }
    }

    /// The operation type of this change.
    pub fn op_type(&self) -> OperationType {
        match self {
            Change::Create { .. } => OperationType::Create,
            Change::Update { .. } => OperationType::Update,
            Change::Delete => OperationType::Delete,
        }
    }

    /// Check the payload is well formed.
    pub fn validate(&self) -> Result<()> {
        match self {
            Change::Create { document } => as_object(document).map(|_| ()),
            Change::Update { patch } => {
                if patch.is_empty() {
                    return Err(Error::InvalidOperation("update patch is empty".into()));
                }
                patch.validate()
            }
            Change::Delete => Ok(()),
        }
    }

    /// Apply the change to the current contents of a document.
    ///
    /// Returns `None` when the change deletes the document.
    pub fn apply_to(&self, current: Option<&Value>) -> Result<Option<Value>> {
        match self {
            Change::Create { document } => {
                as_object(document)?;
                Ok(Some(document.clone()))
            }
            Change::Update { patch } => {
                let current = current.ok_or_else(|| {
                    Error::InvalidDocument("cannot update a document that does not exist".into())
                })?;
                patch.apply_to(current).map(Some)
            }
            Change::Delete => Ok(None),
        }
    }

    /// Compose this change with a later one on the same document.
    pub fn then(self, later: Change) -> Result<Change> {
        let composed = match (self, later) {
            (Change::Create { document }, Change::Update { patch }) => Change::Create {
                document: patch.apply_to(&document)?,
            },
            (Change::Update { patch }, Change::Update { patch: next }) => Change::Update {
                patch: patch.then(&next),
            },
            (_, Change::Delete) => Change::Delete,
            (_, later) => later,
        };
        Ok(composed)
    }
}

/// Status of an operation in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

impl OperationStatus {
    /// Completed and failed operations never change again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationStatus::Pending)
    }
}

/// An operation as submitted by a device, before the log assigns identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    /// Owner of the document
    pub user_id: UserId,
    /// Device that produced the mutation
    pub device_id: DeviceId,
    /// Target collection
    pub collection: CollectionName,
    /// Target document
    pub document_id: DocumentId,
    /// The mutation itself
    pub change: Change,
    /// Local document version produced by this mutation
    pub version: Version,
}

impl NewOperation {
    /// Create a new operation description.
    pub fn new(
        user_id: impl Into<UserId>,
        device_id: impl Into<DeviceId>,
        collection: impl Into<CollectionName>,
        document_id: impl Into<DocumentId>,
        change: Change,
        version: Version,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            collection: collection.into(),
            document_id: document_id.into(),
            change,
            version,
        }
    }

    pub fn document_key(&self) -> DocumentKey {
        DocumentKey::new(
            self.user_id.clone(),
            self.collection.clone(),
            self.document_id.clone(),
        )
    }

    /// Check identifiers, version and payload shape.
    pub fn validate(&self) -> Result<()> {
        validate_reference(
            &self.user_id,
            &self.device_id,
            &self.collection,
            &self.document_id,
            self.version,
        )?;
        self.change.validate()
    }
}

fn validate_reference(
    user_id: &str,
    device_id: &str,
    collection: &str,
    document_id: &str,
    version: Version,
) -> Result<()> {
    let fields = [
        ("userId", user_id),
        ("deviceId", device_id),
        ("collection", collection),
        ("documentId", document_id),
    ];
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(Error::InvalidOperation(format!("{name} must not be empty")));
        }
    }
    if version == 0 {
        return Err(Error::InvalidOperation("version must start at 1".into()));
    }
    Ok(())
}

/// A recorded operation awaiting (or done with) application to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Operation ID
    pub id: OperationId,
    /// Owner of the document
    pub user_id: UserId,
    /// Device that produced the mutation
    pub device_id: DeviceId,
    /// Target collection
    pub collection: CollectionName,
    /// Target document
    pub document_id: DocumentId,
    /// The mutation itself
    pub change: Change,
    /// Local document version produced by this mutation
    pub version: Version,
    /// Lifecycle status
    pub status: OperationStatus,
    /// Failure reason, set once when the operation fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the operation was recorded
    pub created_at: Timestamp,
    /// When the operation reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<Timestamp>,
    /// Log-assigned sequence, breaks ties between equal `created_at`
    #[serde(default)]
    pub seq: u64,
}

impl SyncOperation {
    /// Build a pending operation from a submitted one.
    pub fn from_new(op: NewOperation, id: impl Into<OperationId>, created_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            user_id: op.user_id,
            device_id: op.device_id,
            collection: op.collection,
            document_id: op.document_id,
            change: op.change,
            version: op.version,
            status: OperationStatus::Pending,
            error: None,
            created_at,
            synced_at: None,
            seq: 0,
        }
    }

    /// The operation type.
    pub fn op_type(&self) -> OperationType {
        self.change.op_type()
    }

    /// The (user, device) this operation belongs to.
    pub fn device_key(&self) -> DeviceKey {
        DeviceKey::new(self.user_id.clone(), self.device_id.clone())
    }

    /// The document this operation targets, owned by its user.
    pub fn document_key(&self) -> DocumentKey {
        DocumentKey::new(
            self.user_id.clone(),
            self.collection.clone(),
            self.document_id.clone(),
        )
    }

    /// Whether the operation still awaits application.
    pub fn is_pending(&self) -> bool {
        self.status == OperationStatus::Pending
    }

    /// Check identifiers, version and payload shape.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidOperation("id must not be empty".into()));
        }
        validate_reference(
            &self.user_id,
            &self.device_id,
            &self.collection,
            &self.document_id,
            self.version,
        )?;
        self.change.validate()
    }

    /// Transition to completed. Returns false if already terminal.
    pub fn complete(&mut self, at: Timestamp) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OperationStatus::Completed;
        self.synced_at = Some(at);
        true
    }

    /// Transition to failed. Returns false if already terminal.
    pub fn fail(&mut self, error: impl Into<String>, at: Timestamp) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OperationStatus::Failed;
        self.error = Some(error.into());
        self.synced_at = Some(at);
        true
    }

    /// Replay ordering: (created_at, seq, id).
    pub fn replay_order(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then(self.seq.cmp(&other.seq))
            .then_with(|| self.id.cmp(&other.id))
    }
}
