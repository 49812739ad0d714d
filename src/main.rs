//! `conduitd`: the engine process. Loads configuration from the environment,
//! opens the embedded SQLite store, wires the engine controller and Data
//! Pruner scheduler, and serves the management HTTP surface until a shutdown
//! signal arrives.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use conduit::config::AppConfig;
use conduit::database::{DatabaseConfig, DatabaseConnection};
use conduit::domain::pruning::PrunerConfig;
use conduit::engine::EngineController;
use conduit::observability::init_tracing;
use conduit::pruner::{ChannelSource, PrunerScheduler};
use conduit::rest_api::{self, ApiState};
use conduit::storage::sqlite_store::SqliteMessageStore;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    info!(port = config.server.port.into_inner(), server_id = %config.server_id.as_ref(), "starting conduit");

    let db_config = DatabaseConfig::new(config.database_path.clone()).with_pool_size(config.pool_size);
    let connection = DatabaseConnection::initialize(db_config).await?;
    let store = Arc::new(SqliteMessageStore::new(connection));

    let engine = Arc::new(EngineController::new(Arc::clone(&store)));
    let channel_source: Arc<dyn ChannelSource> = Arc::clone(&engine);
    let pruner = Arc::new(PrunerScheduler::new(Arc::clone(&store), channel_source, PrunerConfig::default()));

    let shutdown = CancellationToken::new();
    let pruner_handle = {
        let pruner = Arc::clone(&pruner);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pruner.run_forever(shutdown).await })
    };

    let state = Arc::new(ApiState::new(engine, store, pruner));
    let router = rest_api::router(state);
    let (listener, addr) = conduit::server::bind(&config).await?;
    info!(%addr, "management HTTP surface listening");

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.cancel();
    });

    conduit::server::serve_with_graceful_shutdown(listener, router, shutdown).await?;
    pruner_handle.abort();
    info!("conduit shut down");
    Ok(())
}
