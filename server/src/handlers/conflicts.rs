//! Manual conflict resolution.

use larder_engine::{CollectionName, ConflictChoice, DocumentKey, UserId};
use serde::Deserialize;

use crate::error::Result;
use crate::sync::Resolution;
use crate::AppState;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// Owner of the conflicted document
    pub user_id: UserId,
    pub collection: CollectionName,
    pub choice: ConflictChoice,
}

pub async fn handle_resolve(
    state: &AppState,
    document_id: &str,
    request: ResolveRequest,
) -> Result<Resolution> {
    state.coordinator.schema().get_collection(&request.collection)?;
    let document = DocumentKey::new(request.user_id, request.collection, document_id);
    Ok(state
        .coordinator
        .resolve_conflict(&document, request.choice)
        .await?)
}
