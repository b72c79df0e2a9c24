//! PostgreSQL persistence for documents and the sync ledger.

mod documents;
mod ledger;
mod pool;

pub use documents::{PgDocumentStore, StoredDocument};
pub use ledger::{PgLedger, StoredOperation};
pub use pool::*;

use crate::store::StoreError;
use crate::sync::LedgerError;

/// Errors that mean the database cannot be reached at all.
fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Engine numbers are `u64`; columns are `BIGINT`.
fn to_bigint(value: u64, what: &str) -> Result<i64, larder_engine::Error> {
    i64::try_from(value).map_err(|_| {
        larder_engine::Error::InvalidOperation(format!("{what} {value} is too large to store"))
    })
}

fn from_bigint(value: i64, what: &str) -> Result<u64, String> {
    u64::try_from(value).map_err(|_| format!("stored {what} {value} is negative"))
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_connection_error(&err) {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        if is_connection_error(&err) {
            LedgerError::Unavailable(err.to_string())
        } else {
            LedgerError::Storage(err.to_string())
        }
    }
}
