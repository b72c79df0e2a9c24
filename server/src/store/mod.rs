//! Document store abstraction: the server of record.
//!
//! The coordinator reads and writes documents only through [`DocumentStore`],
//! so the same sync logic runs against PostgreSQL in production and the
//! in-memory store in tests.

mod memory;

pub use memory::MemoryDocumentStore;

use async_trait::async_trait;
use larder_engine::{ServerDocument, Timestamp};

/// Failures reported by a document store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached at all. A sync pass stops on this.
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    /// A single call failed; other calls may still succeed.
    #[error("document store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<StoreError> for larder_engine::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => larder_engine::Error::Transport(msg),
            StoreError::Backend(msg) => larder_engine::Error::Database(msg),
        }
    }
}

/// CRUD access to server documents by collection and id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, `None` when it does not exist.
    async fn find(&self, collection: &str, id: &str) -> Result<Option<ServerDocument>, StoreError>;

    /// Insert a new document. Fails if one already exists.
    async fn create(&self, document: &ServerDocument) -> Result<(), StoreError>;

    /// Replace an existing document. Fails if it does not exist.
    async fn update(&self, document: &ServerDocument) -> Result<(), StoreError>;

    /// Delete a document. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// Documents of one owner written at or after `since`, oldest first.
    async fn changed_since(
        &self,
        collection: &str,
        owner_id: &str,
        since: Timestamp,
    ) -> Result<Vec<ServerDocument>, StoreError>;
}
