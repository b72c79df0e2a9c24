//! Larder Server - sync server for the Larder recipe app.
//!
//! Devices record mutations offline and replay them here. The server applies
//! them to the documents of record, flags conflicts when another device got
//! there first, and tells the user's other devices when a pass finishes.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod schema;
pub mod store;
pub mod sync;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use larder_engine::SystemClock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::store::{DocumentStore, MemoryDocumentStore};
use crate::sync::{CoordinatorConfig, MemoryLedger, SyncCoordinator, SyncLedger};
use crate::websocket::ConnectionManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SyncCoordinator>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(coordinator: Arc<SyncCoordinator>, config: Config) -> Self {
        Self {
            coordinator,
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        }
    }

    /// State over the given store and ledger with the default schema and
    /// the system clock.
    pub fn with_storage(
        config: Config,
        store: Arc<dyn DocumentStore>,
        ledger: Arc<dyn SyncLedger>,
    ) -> Self {
        let coordinator = SyncCoordinator::new(
            store,
            ledger,
            Arc::new(SystemClock),
            schema::default_schema(),
            CoordinatorConfig::from(&config),
        );
        Self::new(Arc::new(coordinator), config)
    }

    /// State backed by in-memory storage.
    pub fn in_memory(config: Config) -> Self {
        Self::with_storage(
            config,
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryLedger::new()),
        )
    }
}

/// The HTTP application: routes plus tracing and CORS layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
