use std::sync::Arc;

use driftsync::app_state::AppState;
use driftsync::config::Config;
use driftsync::engine;
use driftsync::event::Event;
use driftsync::metrics::MetricsCollector;
use driftsync::storage::sqlite::SqliteStorage;
use driftsync::storage::StorageAdapter;
use driftsync::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env()?);
    tracing::info!(node_id = config.node_id, own_url = %config.own_url, "starting replication engine");

    let storage: Arc<dyn StorageAdapter> = Arc::new(
        SqliteStorage::new(&config.storage_url())
            .await
            .map_err(|e| anyhow::anyhow!(e))?,
    );
    let metrics = Arc::new(MetricsCollector::new());

    let (state, handle, rx, known_peers) =
        engine::bootstrap(config.clone(), storage, metrics.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

    tokio::spawn(engine::run(state, rx, handle.clone()));

    for url in known_peers {
        handle.try_send(Event::AddPeer { url });
    }

    let app_state = AppState { engine_handle: handle.clone(), config: config.clone(), metrics };
    let app = server::router(app_state);

    let addr = config.server_address();
    tracing::info!(%addr, "http/websocket surface listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let shutdown_handle = handle.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown_handle.send(Event::Shutdown).await;
        })
        .await?;

    Ok(())
}
