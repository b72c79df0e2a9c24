//! The `documents` table.

use async_trait::async_trait;
use larder_engine::{ServerDocument, Timestamp};
use sqlx::Row;

use super::{from_bigint, to_bigint, Pool};
use crate::store::{DocumentStore, StoreError};

/// A stored document row.
#[derive(Debug)]
pub struct StoredDocument {
    pub collection: String,
    pub document_id: String,
    pub owner_id: String,
    pub data: serde_json::Value,
    pub version: i64,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredDocument {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredDocument {
            collection: row.try_get("collection")?,
            document_id: row.try_get("document_id")?,
            owner_id: row.try_get("owner_id")?,
            data: row.try_get("data")?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<StoredDocument> for ServerDocument {
    type Error = StoreError;

    fn try_from(row: StoredDocument) -> Result<Self, StoreError> {
        let number = |value: i64, what: &str| {
            from_bigint(value, what).map_err(|e| {
                StoreError::Backend(format!("document {}/{}: {}", row.collection, row.document_id, e))
            })
        };
        let version = number(row.version, "version")?;
        let updated_at = number(row.updated_at, "updated_at")?;
        Ok(ServerDocument::new(
            row.document_id,
            row.collection,
            row.owner_id,
            row.data,
            version,
            updated_at,
        ))
    }
}

/// Version and timestamp of a document as column values.
fn numbers(document: &ServerDocument) -> Result<(i64, i64), StoreError> {
    let column = |value: u64, what: &str| {
        to_bigint(value, what).map_err(|e| StoreError::Backend(e.to_string()))
    };
    Ok((
        column(document.version, "version")?,
        column(document.updated_at, "updatedAt")?,
    ))
}

/// Documents kept in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: Pool,
}

impl PgDocumentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn find(&self, collection: &str, id: &str) -> Result<Option<ServerDocument>, StoreError> {
        let row = sqlx::query_as::<_, StoredDocument>(
            r#"
            SELECT collection, document_id, owner_id, data, version, updated_at
            FROM documents
            WHERE collection = $1 AND document_id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ServerDocument::try_from).transpose()
    }

    async fn create(&self, document: &ServerDocument) -> Result<(), StoreError> {
        let (version, updated_at) = numbers(document)?;
        let result = sqlx::query(
            r#"
            INSERT INTO documents (collection, document_id, owner_id, data, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (collection, document_id) DO NOTHING
            "#,
        )
        .bind(&document.collection)
        .bind(&document.id)
        .bind(&document.owner_id)
        .bind(&document.data)
        .bind(version)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!(
                "document {}/{} already exists",
                document.collection, document.id
            )));
        }
        Ok(())
    }

    async fn update(&self, document: &ServerDocument) -> Result<(), StoreError> {
        let (version, updated_at) = numbers(document)?;
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET owner_id = $3, data = $4, version = $5, updated_at = $6
            WHERE collection = $1 AND document_id = $2
            "#,
        )
        .bind(&document.collection)
        .bind(&document.id)
        .bind(&document.owner_id)
        .bind(&document.data)
        .bind(version)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!(
                "document {}/{} does not exist",
                document.collection, document.id
            )));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND document_id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn changed_since(
        &self,
        collection: &str,
        owner_id: &str,
        since: Timestamp,
    ) -> Result<Vec<ServerDocument>, StoreError> {
        let rows = sqlx::query_as::<_, StoredDocument>(
            r#"
            SELECT collection, document_id, owner_id, data, version, updated_at
            FROM documents
            WHERE collection = $1 AND owner_id = $2 AND updated_at >= $3
            ORDER BY updated_at, document_id
            "#,
        )
        .bind(collection)
        .bind(owner_id)
        .bind(i64::try_from(since).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ServerDocument::try_from).collect()
    }
}
