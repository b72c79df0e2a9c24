//! The `sync_operations` and `sync_states` tables.

use std::collections::BTreeMap;

use async_trait::async_trait;
use larder_engine::{
    AppendOutcome, CollectionCursor, CollectionName, DeviceKey, DocumentKey, OperationStatus,
    SyncOperation, SyncState, Timestamp, Version,
};
use sqlx::types::Json;
use sqlx::Row;

use super::{from_bigint, to_bigint, Pool};
use crate::sync::{LedgerError, SyncLedger};

const OPERATION_COLUMNS: &str = "seq, id, user_id, device_id, collection, document_id, change, \
     version, status, error, created_at, synced_at";

/// A stored operation row.
#[derive(Debug)]
pub struct StoredOperation {
    pub seq: i64,
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub collection: String,
    pub document_id: String,
    pub change: serde_json::Value,
    pub version: i64,
    pub status: String,
    pub error: Option<String>,
    pub created_at: i64,
    pub synced_at: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredOperation {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredOperation {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            device_id: row.try_get("device_id")?,
            collection: row.try_get("collection")?,
            document_id: row.try_get("document_id")?,
            change: row.try_get("change")?,
            version: row.try_get("version")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            synced_at: row.try_get("synced_at")?,
        })
    }
}

impl StoredOperation {
    /// Convert a database row to an engine operation.
    pub fn into_operation(self) -> Result<SyncOperation, LedgerError> {
        let change = serde_json::from_value(self.change).map_err(|e| {
            LedgerError::Storage(format!("operation {} has an unreadable change: {}", self.id, e))
        })?;

        let number = |value: i64, what: &str| {
            from_bigint(value, what)
                .map_err(|e| LedgerError::Storage(format!("operation {}: {}", self.id, e)))
        };
        let version = number(self.version, "version")?;
        let created_at = number(self.created_at, "created_at")?;
        let synced_at = self
            .synced_at
            .map(|at| number(at, "synced_at"))
            .transpose()?;
        let seq = number(self.seq, "seq")?;

        Ok(SyncOperation {
            status: parse_status(&self.status)?,
            id: self.id,
            user_id: self.user_id,
            device_id: self.device_id,
            collection: self.collection,
            document_id: self.document_id,
            change,
            version,
            error: self.error,
            created_at,
            synced_at,
            seq,
        })
    }
}

fn status_name(status: OperationStatus) -> &'static str {
    match status {
        OperationStatus::Pending => "pending",
        OperationStatus::Completed => "completed",
        OperationStatus::Failed => "failed",
    }
}

fn parse_status(raw: &str) -> Result<OperationStatus, LedgerError> {
    match raw {
        "pending" => Ok(OperationStatus::Pending),
        "completed" => Ok(OperationStatus::Completed),
        "failed" => Ok(OperationStatus::Failed),
        other => Err(LedgerError::Storage(format!("unknown operation status '{}'", other))),
    }
}

/// Operation log and sync states kept in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: Pool,
}

impl PgLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn fetch_operations(
        &self,
        filter: &str,
        binds: &[&str],
    ) -> Result<Vec<SyncOperation>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM sync_operations WHERE {} ORDER BY created_at, seq, id",
            OPERATION_COLUMNS, filter
        );
        let mut query = sqlx::query_as::<_, StoredOperation>(&sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(StoredOperation::into_operation)
            .collect()
    }

    /// Move a pending operation to a terminal status.
    async fn finish(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<&str>,
        at: Timestamp,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_operations
            SET status = $2, error = $3, synced_at = $4
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(status_name(status))
        .bind(error)
        .bind(to_bigint(at, "timestamp")?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(larder_engine::Error::OperationNotFound(id.to_string()).into()),
        }
    }
}

#[async_trait]
impl SyncLedger for PgLedger {
    async fn append(&self, op: SyncOperation) -> Result<AppendOutcome, LedgerError> {
        op.validate()?;
        let version = to_bigint(op.version, "version")?;
        let created_at = to_bigint(op.created_at, "createdAt")?;
        let change = serde_json::to_value(&op.change)
            .map_err(|e| LedgerError::Storage(format!("cannot encode change: {}", e)))?;

        let sql = format!(
            r#"
            INSERT INTO sync_operations
                (id, user_id, device_id, collection, document_id, change, version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            RETURNING {}
            "#,
            OPERATION_COLUMNS
        );
        let inserted = sqlx::query_as::<_, StoredOperation>(&sql)
            .bind(&op.id)
            .bind(&op.user_id)
            .bind(&op.device_id)
            .bind(&op.collection)
            .bind(&op.document_id)
            .bind(change)
            .bind(version)
            .bind(created_at)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => Ok(AppendOutcome::Inserted(row.into_operation()?)),
            None => {
                let existing = self.get(&op.id).await?.ok_or_else(|| {
                    LedgerError::Storage(format!("operation {} vanished during append", op.id))
                })?;
                Ok(AppendOutcome::Duplicate(existing))
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<SyncOperation>, LedgerError> {
        let sql = format!("SELECT {} FROM sync_operations WHERE id = $1", OPERATION_COLUMNS);
        sqlx::query_as::<_, StoredOperation>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(StoredOperation::into_operation)
            .transpose()
    }

    async fn pending(&self, key: &DeviceKey) -> Result<Vec<SyncOperation>, LedgerError> {
        self.fetch_operations(
            "status = 'pending' AND user_id = $1 AND device_id = $2",
            &[key.user_id.as_str(), key.device_id.as_str()],
        )
        .await
    }

    async fn pending_for_document(&self, key: &DocumentKey) -> Result<Vec<SyncOperation>, LedgerError> {
        self.fetch_operations(
            "status = 'pending' AND user_id = $1 AND collection = $2 AND document_id = $3",
            &[
                key.owner_id.as_str(),
                key.collection.as_str(),
                key.document_id.as_str(),
            ],
        )
        .await
    }

    async fn latest_version(&self, key: &DocumentKey) -> Result<Option<Version>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(version) AS version
            FROM sync_operations
            WHERE user_id = $1 AND collection = $2 AND document_id = $3
            "#,
        )
        .bind(&key.owner_id)
        .bind(&key.collection)
        .bind(&key.document_id)
        .fetch_one(&self.pool)
        .await?;
        let version: Option<i64> = row.try_get("version")?;
        version
            .map(|v| from_bigint(v, "version").map_err(LedgerError::Storage))
            .transpose()
    }

    async fn mark_completed(&self, id: &str, at: Timestamp) -> Result<bool, LedgerError> {
        self.finish(id, OperationStatus::Completed, None, at).await
    }

    async fn mark_failed(&self, id: &str, error: &str, at: Timestamp) -> Result<bool, LedgerError> {
        self.finish(id, OperationStatus::Failed, Some(error), at).await
    }

    async fn devices_with_pending(&self) -> Result<Vec<DeviceKey>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT user_id, device_id
            FROM sync_operations
            WHERE status = 'pending'
            ORDER BY user_id, device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DeviceKey, LedgerError> {
                Ok(DeviceKey::new(
                    row.try_get::<String, _>("user_id")?,
                    row.try_get::<String, _>("device_id")?,
                ))
            })
            .collect()
    }

    async fn load_state(&self, key: &DeviceKey) -> Result<SyncState, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT last_sync_timestamp, collections
            FROM sync_states
            WHERE user_id = $1 AND device_id = $2
            "#,
        )
        .bind(&key.user_id)
        .bind(&key.device_id)
        .fetch_optional(&self.pool)
        .await?;

        let mut state = SyncState::new(key.user_id.clone(), key.device_id.clone());
        if let Some(row) = row {
            let last_sync: i64 = row.try_get("last_sync_timestamp")?;
            let Json(collections): Json<BTreeMap<CollectionName, CollectionCursor>> =
                row.try_get("collections")?;
            state.last_sync_timestamp =
                from_bigint(last_sync, "last_sync_timestamp").map_err(LedgerError::Storage)?;
            state.collections = collections;
        }
        Ok(state)
    }

    async fn save_state(&self, state: &SyncState) -> Result<(), LedgerError> {
        let last_sync = to_bigint(state.last_sync_timestamp, "lastSyncTimestamp")?;
        sqlx::query(
            r#"
            INSERT INTO sync_states (user_id, device_id, last_sync_timestamp, collections, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id, device_id) DO UPDATE SET
                last_sync_timestamp = EXCLUDED.last_sync_timestamp,
                collections = EXCLUDED.collections,
                updated_at = NOW()
            "#,
        )
        .bind(&state.user_id)
        .bind(&state.device_id)
        .bind(last_sync)
        .bind(Json(&state.collections))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
