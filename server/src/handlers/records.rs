//! Cached record listing.

use larder_engine::{UserId, VersionedRecord};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsQuery {
    pub owner_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsResponse {
    pub records: Vec<VersionedRecord>,
    /// How many of the records await a conflict choice
    pub conflicts: usize,
}

pub fn handle_records(state: &AppState, query: RecordsQuery) -> RecordsResponse {
    let records = state.coordinator.list_records(&query.owner_id);
    let conflicts = records.iter().filter(|r| r.is_conflicted()).count();
    RecordsResponse { records, conflicts }
}
