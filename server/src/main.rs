//! Larder Server entry point.

use std::sync::Arc;

use larder_server::config::Config;
use larder_server::db::{self, PgDocumentStore, PgLedger};
use larder_server::sync::{spawn_periodic_sync, EventSink};
use larder_server::{build_router, AppState};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "larder_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Larder Server on {}:{}", config.host, config.port);

    let state = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;
            tracing::info!("Running database migrations...");
            db::run_migrations(&pool).await?;
            AppState::with_storage(
                config.clone(),
                Arc::new(PgDocumentStore::new(pool.clone())),
                Arc::new(PgLedger::new(pool)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage");
            AppState::in_memory(config.clone())
        }
    };

    let shutdown = CancellationToken::new();
    let scheduler = config.sync_interval.map(|interval| {
        let events: Arc<dyn EventSink> = state.conn_manager.clone();
        spawn_periodic_sync(state.coordinator.clone(), events, interval, shutdown.clone())
    });

    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(handle) = scheduler {
        handle.await?;
    }

    Ok(())
}
