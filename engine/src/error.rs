//! Error types for the Larder engine.

use crate::{CollectionName, DocumentId, OperationId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All possible errors from the Larder engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("document {0} belongs to another user")]
    NotOwner(DocumentId),

    // Lookup errors
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    // Conflict errors
    #[error("document {0} is not in conflict state")]
    NotInConflict(DocumentId),

    #[error("unresolved conflict on document {0}")]
    UnresolvedConflict(DocumentId),

    #[error("document {0} already exists")]
    DocumentExists(DocumentId),

    // Collaborator failures
    #[error("database error: {0}")]
    Database(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),
}

impl Error {
    /// Classify this error into the reporting taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidOperation(_)
            | Error::InvalidDocument(_)
            | Error::CollectionNotFound(_)
            | Error::MissingRequiredField(_)
            | Error::TypeMismatch { .. }
            | Error::NotOwner(_) => ErrorKind::Validation,
            Error::DocumentNotFound(_) | Error::OperationNotFound(_) => ErrorKind::NotFound,
            Error::NotInConflict(_) | Error::UnresolvedConflict(_) | Error::DocumentExists(_) => {
                ErrorKind::Conflict
            }
            Error::Database(_) => ErrorKind::Database,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Coarse error categories surfaced to callers in sync reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Database,
    Transport,
    Timeout,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::CollectionNotFound("recipes".into());
        assert_eq!(err.to_string(), "collection not found: recipes");

        let err = Error::NotInConflict("recipe-1".into());
        assert_eq!(err.to_string(), "document recipe-1 is not in conflict state");

        let err = Error::TypeMismatch {
            field: "servings".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'servings': expected Int, got String"
        );
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            Error::InvalidOperation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            Error::DocumentNotFound("d".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(Error::NotInConflict("d".into()).kind(), ErrorKind::Conflict);
        assert_eq!(Error::DocumentExists("d".into()).kind(), ErrorKind::Conflict);
        assert_eq!(Error::NotOwner("d".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::Transport("down".into()).kind(), ErrorKind::Transport);
        assert_eq!(Error::Timeout(50).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::NotFound).unwrap();
        assert_eq!(json, "\"notFound\"");
    }
}
