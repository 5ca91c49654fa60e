//! Shared harness for the black-box multi-node scenarios. Each node runs a
//! real `EngineState`/`run` loop over `MemoryStorage`; nodes are wired
//! together with `InProcessTransport` pairs, bypassing the network dial and
//! HTTP upgrade path the same way the unit tests bypass real sockets.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use driftsync::config::{Config, ServerConfig, TimingConfig};
use driftsync::engine;
use driftsync::event::{EngineHandle, Event};
use driftsync::metrics::MetricsCollector;
use driftsync::storage::memory::MemoryStorage;
use driftsync::storage::StorageAdapter;
use driftsync::transport;

pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        event_queue_depth: 1024,
        gossip_interval: Duration::from_millis(30),
        heartbeat_interval: Duration::from_millis(150),
        peer_dead_after: Duration::from_secs(30),
        persist_interval: Duration::from_secs(60),
        dependency_sweep_interval: Duration::from_millis(30),
        update_request_timeout: Duration::from_secs(2),
        reconnect_initial_backoff: Duration::from_millis(50),
        reconnect_max_backoff: Duration::from_millis(200),
        reconnect_jitter: 0.1,
        storage_call_timeout: Duration::from_secs(5),
        default_max_results: 100,
        dependency_buffer_warn_threshold: 10_000,
    }
}

pub struct Node {
    pub handle: EngineHandle,
    pub storage: Arc<dyn StorageAdapter>,
    pub config: Arc<Config>,
}

pub async fn spawn_node(node_id: u64, url: &str) -> Node {
    let config = Arc::new(Config {
        own_url: url.to_string(),
        peer_urls: vec![],
        jwt_secret: "test-secret".to_string(),
        node_id,
        server: ServerConfig { host: "127.0.0.1".to_string(), port: 0 },
        timing: fast_timing(),
        storage_path: ":memory:".to_string(),
    });
    let storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
    let metrics = Arc::new(MetricsCollector::new());
    let (state, handle, rx, _known_peers) =
        engine::bootstrap(config.clone(), storage.clone(), metrics).await.unwrap();
    tokio::spawn(engine::run(state, rx, handle.clone()));
    Node { handle, storage, config }
}

/// Wires two already-running nodes together directly, the way
/// `server::ws_handler` and `transport::dial` would after a successful
/// handshake, without a real socket in between.
pub async fn link(a: &Node, b: &Node) {
    let (ta, tb) = transport::InProcessTransport::pair();
    let (outbox_a, join_a) =
        transport::spawn_connection(Box::new(ta), b.config.own_url.clone(), a.handle.clone());
    let (outbox_b, join_b) =
        transport::spawn_connection(Box::new(tb), a.config.own_url.clone(), b.handle.clone());

    a.handle
        .send(Event::IncomingConnection {
            peer_node_id: b.config.node_id.to_string(),
            peer_url: b.config.own_url.clone(),
            outbox: outbox_a,
            join: join_a,
        })
        .await;
    b.handle
        .send(Event::IncomingConnection {
            peer_node_id: a.config.node_id.to_string(),
            peer_url: a.config.own_url.clone(),
            outbox: outbox_b,
            join: join_b,
        })
        .await;
}

/// Polls `check` until it returns `true` or `timeout` elapses, returning
/// whether it converged in time.
pub async fn wait_until<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}
