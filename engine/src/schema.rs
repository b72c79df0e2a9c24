//! Schema definition and validation.
//!
//! Schemas declare the watched collections and their fields, so malformed
//! operations are rejected as validation errors before they reach the
//! server of record.

use crate::{error::Result, Change, CollectionName, Error, NewOperation, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Value type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since the epoch
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        }
    }

    /// Whether a non-null value fits this type. Integers are valid floats.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int | FieldType::Timestamp => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Json => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One declared field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Required fields may be neither absent nor null
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::declare(name, field_type, true)
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::declare(name, field_type, false)
    }

    fn declare(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            required,
        }
    }

    /// Check a field's value; `None` means the field is absent.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        let value = match value {
            Some(Value::Null) | None => {
                return if self.required {
                    Err(Error::MissingRequiredField(self.name.clone()))
                } else {
                    Ok(())
                };
            }
            Some(value) => value,
        };

        if self.field_type.accepts(value) {
            return Ok(());
        }
        Err(Error::TypeMismatch {
            field: self.name.clone(),
            expected: self.field_type.to_string(),
            got: describe(value).to_string(),
        })
    }
}

/// Name of a JSON value's shape, in the vocabulary of [`FieldType`].
fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_f64() => "Float",
        Value::Number(_) => "Int",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Declared fields of one collection. Undeclared fields are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub name: CollectionName,
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a whole document.
    pub fn validate_payload(&self, payload: &Value) -> Result<()> {
        let Some(values) = payload.as_object() else {
            return Err(Error::InvalidDocument("document must be a JSON object".into()));
        };
        self.fields
            .iter()
            .try_for_each(|field| field.validate(values.get(&field.name)))
    }

    /// Validate a change. Patches are checked field by field; undeclared
    /// fields pass through untyped.
    pub fn validate_change(&self, change: &Change) -> Result<()> {
        match change {
            Change::Create { document } => self.validate_payload(document),
            Change::Update { patch } => {
                for (name, value) in &patch.set {
                    if let Some(field) = self.field(name) {
                        field.validate(Some(value))?;
                    }
                }
                for name in &patch.unset {
                    if let Some(field) = self.field(name) {
                        field.validate(None)?;
                    }
                }
                Ok(())
            }
            Change::Delete => Ok(()),
        }
    }
}

/// Schema for every watched collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version
    pub version: SchemaVersion,
    /// Collection schemas by name
    pub collections: HashMap<CollectionName, CollectionSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            collections: HashMap::new(),
        }
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    /// Get a collection schema by name.
    pub fn get_collection(&self, name: &str) -> Result<&CollectionSchema> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Whether a collection is declared.
    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    /// Declared collection names, sorted.
    pub fn collection_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.collections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Validate a change against its collection.
    pub fn validate_change(&self, collection: &str, change: &Change) -> Result<()> {
        self.get_collection(collection)?.validate_change(change)
    }

    /// Validate a full document against its collection.
    pub fn validate_document(&self, collection: &str, document: &Value) -> Result<()> {
        self.get_collection(collection)?.validate_payload(document)
    }

    /// Validate a submitted operation: references, payload shape and fields.
    pub fn validate_operation(&self, op: &NewOperation) -> Result<()> {
        op.validate()?;
        self.validate_change(&op.collection, &op.change)
    }
}
