//! In-memory document store.

use async_trait::async_trait;
use dashmap::DashMap;
use larder_engine::{CollectionName, DocumentId, ServerDocument, Timestamp};

use super::{DocumentStore, StoreError};

/// Documents kept in a concurrent map keyed by (collection, id).
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<(CollectionName, DocumentId), ServerDocument>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a document directly, bypassing sync. Used to seed data and to
    /// simulate edits made elsewhere.
    pub fn put(&self, document: ServerDocument) {
        self.documents
            .insert((document.collection.clone(), document.id.clone()), document);
    }

    /// Read a document directly.
    pub fn get(&self, collection: &str, id: &str) -> Option<ServerDocument> {
        self.documents
            .get(&(collection.to_string(), id.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find(&self, collection: &str, id: &str) -> Result<Option<ServerDocument>, StoreError> {
        Ok(self.get(collection, id))
    }

    async fn create(&self, document: &ServerDocument) -> Result<(), StoreError> {
        let key = (document.collection.clone(), document.id.clone());
        match self.documents.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Backend(format!(
                "document {}/{} already exists",
                document.collection, document.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(document.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, document: &ServerDocument) -> Result<(), StoreError> {
        let key = (document.collection.clone(), document.id.clone());
        match self.documents.get_mut(&key) {
            Some(mut existing) => {
                *existing = document.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "document {}/{} does not exist",
                document.collection, document.id
            ))),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .documents
            .remove(&(collection.to_string(), id.to_string()))
            .is_some())
    }

    async fn changed_since(
        &self,
        collection: &str,
        owner_id: &str,
        since: Timestamp,
    ) -> Result<Vec<ServerDocument>, StoreError> {
        let mut documents: Vec<ServerDocument> = self
            .documents
            .iter()
            .filter(|entry| {
                let doc = entry.value();
                doc.collection == collection && doc.owner_id == owner_id && doc.updated_at >= since
            })
            .map(|entry| entry.value().clone())
            .collect();
        documents.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
        Ok(documents)
    }
}
