//! The state machine: a single logical thread owning all replication
//! state. Every mutation happens inside `EngineState::handle`, invoked by
//! `run` as events are drained from the bounded queue. No other code path
//! is permitted to touch `EngineState`'s fields.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth;
use crate::buffer::DependencyBuffer;
use crate::clock::{now_millis, Timestamp};
use crate::config::{Config, TimingConfig};
use crate::error::{AppError, AppResult};
use crate::event::{EngineHandle, Event};
use crate::metrics::MetricsCollector;
use crate::peer::{ConnectionState, Peer, PendingUpdateRequest};
use crate::sequences::NodeSequences;
use crate::storage::StorageAdapter;
use crate::transport::{self, OutboundFrame};
use crate::update::{Update, UpdateType};
use crate::wire::{
    BatchUpdatePayload, GossipPayload, HeartbeatPayload, Message, MessageContent,
    UpdateRequestPayload,
};

struct PeerEntry {
    peer: Peer,
    outbox: mpsc::UnboundedSender<OutboundFrame>,
    join: JoinHandle<()>,
}

/// Persisted shape: `{node_sequences, timestamp, peer_urls}`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PersistedState {
    node_sequences: NodeSequences,
    timestamp: Timestamp,
    peer_urls: Vec<String>,
}

pub struct EngineState {
    own_url: String,
    own_node_id: u64,
    config: Arc<Config>,
    storage: Arc<dyn StorageAdapter>,
    metrics: Arc<MetricsCollector>,

    peers: HashMap<String, PeerEntry>,
    node_sequences: NodeSequences,
    buffered: DependencyBuffer,
    update_requests: HashMap<String, PendingUpdateRequest>,
    timestamp: Timestamp,
    scheduled: HashSet<String>,
    last_saved_state: Option<Vec<u8>>,
    reconnect_attempts: HashMap<String, u32>,
}

/// Builds the initial engine state from persisted storage (or defaults)
/// and returns the handle producers use, plus the peer URLs to dial at
/// startup (config-declared peers plus any remembered from the last run).
pub async fn bootstrap(
    config: Arc<Config>,
    storage: Arc<dyn StorageAdapter>,
    metrics: Arc<MetricsCollector>,
) -> AppResult<(EngineState, EngineHandle, mpsc::Receiver<Event>, Vec<String>)> {
    let (tx, rx) = mpsc::channel(config.timing.event_queue_depth);
    let handle = EngineHandle::new(tx);

    let mut node_sequences = NodeSequences::new();
    let mut timestamp = Timestamp::ZERO;
    let mut known_peers = config.peer_urls.clone();

    if let Some(bytes) = storage.load_state().await? {
        let persisted: PersistedState =
            serde_json::from_slice(&bytes).map_err(|e| AppError::StateCorrupt(e.to_string()))?;
        node_sequences = persisted.node_sequences;
        timestamp = persisted.timestamp;
        for url in persisted.peer_urls {
            if !known_peers.contains(&url) {
                known_peers.push(url);
            }
        }
    }

    let state = EngineState {
        own_url: config.own_url.clone(),
        own_node_id: config.node_id,
        config,
        storage,
        metrics,
        peers: HashMap::new(),
        node_sequences,
        buffered: DependencyBuffer::new(),
        update_requests: HashMap::new(),
        timestamp,
        scheduled: HashSet::new(),
        last_saved_state: None,
        reconnect_attempts: HashMap::new(),
    };

    known_peers.retain(|u| u != &state.own_url);
    Ok((state, handle, rx, known_peers))
}

/// Drives the event loop until `Event::Shutdown` is observed.
pub async fn run(mut state: EngineState, mut rx: mpsc::Receiver<Event>, handle: EngineHandle) {
    let timing = state.config.timing.clone();
    spawn_periodic_tick(handle.clone(), timing.gossip_interval, || Event::GossipTick);
    spawn_periodic_tick(handle.clone(), timing.heartbeat_interval, || Event::HeartbeatTick);
    spawn_periodic_tick(handle.clone(), timing.persist_interval, || Event::PersistState);
    spawn_periodic_tick(handle.clone(), timing.dependency_sweep_interval, || {
        Event::DependencySweep
    });

    while let Some(event) = rx.recv().await {
        if matches!(event, Event::Shutdown) {
            state.shutdown().await;
            break;
        }
        state.handle(event, &handle).await;
    }
}

fn spawn_periodic_tick(
    handle: EngineHandle,
    interval: Duration,
    make_event: fn() -> Event,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            handle.try_send(make_event());
        }
    });
}

fn backoff_for(attempt: u32, timing: &TimingConfig) -> Duration {
    let base = timing.reconnect_initial_backoff.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let capped = base.min(timing.reconnect_max_backoff.as_secs_f64());
    let jitter_span = capped * timing.reconnect_jitter;
    let jitter = rand::rng().random_range(-jitter_span..=jitter_span);
    Duration::from_secs_f64((capped + jitter).max(0.05))
}

impl EngineState {
    /// Boxed rather than a plain `async fn` because `ScheduledFire`
    /// recurses into this same method once it clears the schedule key.
    fn handle<'a>(
        &'a mut self,
        event: Event,
        handle: &'a EngineHandle,
    ) -> futures::future::BoxFuture<'a, ()> {
        Box::pin(self.handle_inner(event, handle))
    }

    async fn handle_inner(&mut self, event: Event, handle: &EngineHandle) {
        match event {
            Event::ReceivedUpdate { peer_url, update } => {
                self.apply_or_buffer(update).await;
                self.touch_peer(&peer_url);
            }
            Event::GossipMessage { peer_url, node_id, known_peers, last_sequences } => {
                self.handle_gossip(peer_url, node_id, known_peers, last_sequences, handle);
            }
            Event::UpdateRequest { peer_url, since, max_results } => {
                self.handle_update_request(peer_url, since, max_results, handle).await;
            }
            Event::BatchUpdate { peer_url, updates, has_more } => {
                self.handle_batch_update(peer_url, updates, has_more, handle).await;
            }
            Event::AddPeer { url } => {
                self.handle_add_peer(url, handle);
            }
            Event::ConnectPeer { url } => {
                self.handle_connect_peer(url, handle.clone());
            }
            Event::DialOutcome { url, result } => {
                self.handle_dial_outcome(url, result, handle);
            }
            Event::IncomingConnection { peer_node_id, peer_url, outbox, join } => {
                self.register_peer_connection(peer_url.clone(), outbox, join, handle);
                if let Some(entry) = self.peers.get_mut(&peer_url) {
                    entry.peer.display_name = Some(peer_node_id);
                }
            }
            Event::SendGossip { peer_url } => {
                self.send_gossip_to(&peer_url, handle);
            }
            Event::GossipTick => {
                let urls: Vec<String> = self.peers.keys().cloned().collect();
                for url in urls {
                    self.send_gossip_to(&url, handle);
                }
            }
            Event::PeerHeartbeat { peer_url, sequences } => {
                if let Some(entry) = self.peers.get_mut(&peer_url) {
                    entry.peer.last_known_sequences.merge(&sequences);
                    entry.peer.last_active = Instant::now();
                }
            }
            Event::HeartbeatTick => {
                self.handle_heartbeat_tick(handle);
            }
            Event::PeerDisconnect { peer_url } => {
                self.handle_peer_disconnect(peer_url, handle);
            }
            Event::SubmitLocal { updates, reply } => {
                self.handle_submit_local(updates, reply, handle).await;
            }
            Event::PersistState => {
                self.persist_state().await;
            }
            Event::DependencySweep => {
                self.sweep_dependency_buffer().await;
            }
            Event::UpdateRequestTimeout { peer_url } => {
                if let Some(req) = self.update_requests.get(&peer_url) {
                    if req.in_progress {
                        tracing::warn!(peer = %peer_url, "update request timed out");
                        self.update_requests.remove(&peer_url);
                    }
                }
            }
            Event::ScheduledFire { key, inner } => {
                self.scheduled.remove(&key);
                self.handle(*inner, handle).await;
            }
            Event::Shutdown => unreachable!("handled in run()"),
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("engine shutting down, draining peer connections");
        let mut joins = Vec::new();
        for (_, entry) in self.peers.drain() {
            let _ = entry.outbox.send(OutboundFrame::Close);
            joins.push(entry.join);
        }
        let drain = futures::future::join_all(joins);
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            tracing::warn!("timed out waiting for peer connections to close");
        }
        self.persist_state().await;
    }

    fn schedule(&mut self, key: String, event: Event, delay: Duration, handle: &EngineHandle) {
        if self.scheduled.contains(&key) {
            return;
        }
        self.scheduled.insert(key.clone());
        let h = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            h.try_send(Event::ScheduledFire { key, inner: Box::new(event) });
        });
    }

    /// Spec's `NextTimestamp()`: strictly greater than any prior observed
    /// timestamp, and advances the local node's own sequence entry in the
    /// same stroke (a local update's header is the two bound together).
    fn next_update_header(&mut self) -> (u64, Timestamp) {
        self.timestamp = self.timestamp.next(now_millis());
        let seq = self.node_sequences.get(self.own_node_id).unwrap_or(0) + 1;
        self.node_sequences.update(self.own_node_id, seq);
        (seq, self.timestamp)
    }

    /// Bounds every storage call to `timing.storage_call_timeout` (spec §5:
    /// the event loop is single-threaded and must never suspend
    /// unboundedly on a collaborator). A timed-out call surfaces as an
    /// ordinary storage error so callers retry/rebuffer the same as any
    /// other storage failure.
    async fn with_storage_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        match tokio::time::timeout(self.config.timing.storage_call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Storage("storage call timed out".to_string())),
        }
    }

    async fn apply_update(&mut self, update: Update) -> AppResult<()> {
        let commit = self.storage.commit_updates(std::slice::from_ref(&update));
        match self.with_storage_timeout(commit).await {
            Ok(()) => {
                self.node_sequences.update(update.node_id, update.sequence_no);
                self.timestamp = self.timestamp.max(update.timestamp);
                self.metrics.record_update_applied();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    database = %update.database_name,
                    record = %update.record_id,
                    error = %e,
                    "storage commit failed, re-buffering for retry"
                );
                let threshold = self.config.timing.dependency_buffer_warn_threshold;
                self.buffered.push(update, threshold);
                Err(e)
            }
        }
    }

    /// Applies an update if its database exists locally, else buffers it.
    /// Shared by `BatchUpdate` and the single-update push path.
    async fn apply_or_buffer(&mut self, update: Update) {
        if update.update_type == UpdateType::CreateDatabase {
            let db = update.database_name.clone();
            if self.apply_update(update).await.is_ok() {
                self.drain_dependency_buffer(&db).await;
            }
            return;
        }
        let exists_check = self.storage.database_exists(&update.database_name);
        let exists = self.with_storage_timeout(exists_check).await.unwrap_or(false);
        if exists {
            let _ = self.apply_update(update).await;
        } else {
            let threshold = self.config.timing.dependency_buffer_warn_threshold;
            self.buffered.push(update, threshold);
        }
    }

    async fn drain_dependency_buffer(&mut self, database_name: &str) {
        let pending = self.buffered.drain(database_name);
        for update in pending {
            // Failures re-enter the buffer via `apply_update`'s error path.
            let _ = self.apply_update(update).await;
        }
    }

    async fn sweep_dependency_buffer(&mut self) {
        for db in self.buffered.databases() {
            let exists_check = self.storage.database_exists(&db);
            let exists = self.with_storage_timeout(exists_check).await.unwrap_or(false);
            if exists || self.buffered.front_is_create_database(&db) {
                self.drain_dependency_buffer(&db).await;
            }
        }
    }

    fn touch_peer(&mut self, peer_url: &str) {
        if let Some(entry) = self.peers.get_mut(peer_url) {
            entry.peer.last_active = Instant::now();
        }
    }

    fn handle_gossip(
        &mut self,
        peer_url: String,
        node_id: String,
        known_peers: Vec<String>,
        last_sequences: NodeSequences,
        handle: &EngineHandle,
    ) {
        if let Some(entry) = self.peers.get_mut(&peer_url) {
            entry.peer.display_name = Some(node_id);
            entry.peer.last_known_sequences = last_sequences.clone();
            entry.peer.last_active = Instant::now();
        }

        for url in known_peers {
            if url != self.own_url && !self.peers.contains_key(&url) {
                handle.try_send(Event::AddPeer { url });
            }
        }

        if !self.node_sequences.nodes_behind(&last_sequences).is_empty() {
            self.maybe_request_updates(&peer_url, handle);
        }
    }

    fn maybe_request_updates(&mut self, peer_url: &str, handle: &EngineHandle) {
        let in_progress = self
            .update_requests
            .get(peer_url)
            .map(|r| r.in_progress)
            .unwrap_or(false);
        if in_progress {
            return;
        }
        let since = self.node_sequences.clone();
        self.send_update_request(peer_url, since, handle);
    }

    fn send_update_request(&mut self, peer_url: &str, since: NodeSequences, handle: &EngineHandle) {
        self.update_requests.insert(
            peer_url.to_string(),
            PendingUpdateRequest {
                peer_url: peer_url.to_string(),
                since_sequences: since.clone(),
                in_progress: true,
            },
        );
        let max_results = self.config.timing.default_max_results;
        let msg = Message {
            node_sequences: self.node_sequences.clone(),
            content: MessageContent::UpdateRequest(UpdateRequestPayload { since, max_results }),
        };
        self.send_message(peer_url, &msg, handle);

        let key = format!("update_request_timeout:{peer_url}");
        let timeout = self.config.timing.update_request_timeout;
        self.schedule(
            key,
            Event::UpdateRequestTimeout { peer_url: peer_url.to_string() },
            timeout,
            handle,
        );
    }

    async fn handle_update_request(
        &mut self,
        peer_url: String,
        since: NodeSequences,
        max_results: i32,
        handle: &EngineHandle,
    ) {
        self.touch_peer(&peer_url);
        let query = self.storage.get_updates_since(&since, max_results);
        match self.with_storage_timeout(query).await {
            Ok((updates, has_more)) => {
                let msg = Message {
                    node_sequences: self.node_sequences.clone(),
                    content: MessageContent::BatchUpdate(BatchUpdatePayload { updates, has_more }),
                };
                self.send_message(&peer_url, &msg, handle);
            }
            Err(e) => {
                tracing::error!(peer = %peer_url, error = %e, "failed to answer update request");
            }
        }
    }

    async fn handle_batch_update(
        &mut self,
        peer_url: String,
        updates: Vec<Update>,
        has_more: bool,
        handle: &EngineHandle,
    ) {
        for update in updates {
            self.apply_or_buffer(update).await;
        }
        self.touch_peer(&peer_url);

        let in_progress = self
            .update_requests
            .get(&peer_url)
            .map(|r| r.in_progress)
            .unwrap_or(false);
        if !in_progress {
            return;
        }
        if has_more {
            let since = self.node_sequences.clone();
            self.send_update_request(&peer_url, since, handle);
        } else {
            self.update_requests.remove(&peer_url);
        }
    }

    fn handle_add_peer(&mut self, url: String, handle: &EngineHandle) {
        if url == self.own_url || self.peers.contains_key(&url) {
            return;
        }
        handle.try_send(Event::ConnectPeer { url });
    }

    fn handle_connect_peer(&mut self, url: String, handle: EngineHandle) {
        if url == self.own_url || self.peers.contains_key(&url) {
            return;
        }
        let own_node_id = self.own_node_id;
        let own_url = self.own_url.clone();
        let secret = self.config.jwt_secret.clone();
        let url2 = url.clone();
        let dial_handle = handle.clone();
        tokio::spawn(async move {
            let result = transport::dial(&url2, own_node_id, &own_url, &secret, dial_handle.clone()).await;
            dial_handle.send(Event::DialOutcome { url: url2, result }).await;
        });
    }

    fn handle_dial_outcome(
        &mut self,
        url: String,
        result: Result<(mpsc::UnboundedSender<OutboundFrame>, JoinHandle<()>), String>,
        handle: &EngineHandle,
    ) {
        match result {
            Ok((outbox, join)) => {
                self.reconnect_attempts.remove(&url);
                self.register_peer_connection(url, outbox, join, handle);
            }
            Err(reason) => {
                tracing::warn!(peer = %url, error = %reason, "dial failed, scheduling retry");
                let attempt = *self.reconnect_attempts.get(&url).unwrap_or(&0);
                self.reconnect_attempts.insert(url.clone(), attempt + 1);
                let delay = backoff_for(attempt, &self.config.timing);
                self.schedule(
                    format!("connect:{url}"),
                    Event::ConnectPeer { url },
                    delay,
                    handle,
                );
            }
        }
    }

    fn register_peer_connection(
        &mut self,
        url: String,
        outbox: mpsc::UnboundedSender<OutboundFrame>,
        join: JoinHandle<()>,
        handle: &EngineHandle,
    ) {
        let mut peer = Peer::new_connected(url.clone());
        peer.connection_state = ConnectionState::Connected;
        self.peers.insert(url.clone(), PeerEntry { peer, outbox, join });
        self.metrics.record_peer_connected();
        self.send_gossip_to(&url, handle);
    }

    fn handle_heartbeat_tick(&mut self, handle: &EngineHandle) {
        let now = Instant::now();
        let dead_after = self.config.timing.peer_dead_after;
        let mut dead = Vec::new();
        let urls: Vec<String> = self.peers.keys().cloned().collect();
        for url in urls {
            let is_dead = self
                .peers
                .get(&url)
                .map(|e| now.duration_since(e.peer.last_active) > dead_after)
                .unwrap_or(false);
            if is_dead {
                dead.push(url);
                continue;
            }
            let sequences = self.node_sequences.clone();
            let msg = Message {
                node_sequences: sequences.clone(),
                content: MessageContent::Heartbeat(HeartbeatPayload { sequences }),
            };
            self.send_message(&url, &msg, handle);
        }
        for url in dead {
            tracing::warn!(peer = %url, "peer heartbeat stale, treating as disconnected");
            handle.try_send(Event::PeerDisconnect { peer_url: url });
        }
    }

    fn handle_peer_disconnect(&mut self, peer_url: String, handle: &EngineHandle) {
        if let Some(entry) = self.peers.remove(&peer_url) {
            let _ = entry.outbox.send(OutboundFrame::Close);
            self.metrics.record_peer_disconnected();
        }
        self.update_requests.remove(&peer_url);

        let attempt = *self.reconnect_attempts.get(&peer_url).unwrap_or(&0);
        let delay = if attempt == 0 {
            self.config.timing.reconnect_initial_backoff
        } else {
            backoff_for(attempt, &self.config.timing)
        };
        self.reconnect_attempts.insert(peer_url.clone(), attempt + 1);
        self.schedule(
            format!("connect:{peer_url}"),
            Event::ConnectPeer { url: peer_url },
            delay,
            handle,
        );
    }

    async fn handle_submit_local(
        &mut self,
        mut updates: Vec<Update>,
        reply: tokio::sync::oneshot::Sender<AppResult<()>>,
        handle: &EngineHandle,
    ) {
        for update in updates.iter_mut() {
            let (seq, ts) = self.next_update_header();
            update.node_id = self.own_node_id;
            update.sequence_no = seq;
            update.timestamp = ts;
        }

        let mut result = Ok(());
        for update in &updates {
            let commit = self.storage.commit_updates(std::slice::from_ref(update));
            if let Err(e) = self.with_storage_timeout(commit).await {
                result = Err(e);
                break;
            }
            self.metrics.record_update_applied();
        }

        if result.is_ok() {
            let peer_urls: Vec<String> = self.peers.keys().cloned().collect();
            for update in &updates {
                let msg = Message {
                    node_sequences: self.node_sequences.clone(),
                    content: MessageContent::Update(update.clone()),
                };
                for peer_url in &peer_urls {
                    self.send_message(peer_url, &msg, handle);
                }
            }
        }
        let _ = reply.send(result);
    }

    fn send_gossip_to(&mut self, peer_url: &str, handle: &EngineHandle) {
        let known_peers: Vec<String> = std::iter::once(self.own_url.clone())
            .chain(self.peers.keys().cloned())
            .collect();
        let msg = Message {
            node_sequences: self.node_sequences.clone(),
            content: MessageContent::Gossip(GossipPayload {
                node_id: self.own_node_id.to_string(),
                known_peers,
                last_sequences: self.node_sequences.clone(),
            }),
        };
        self.send_message(peer_url, &msg, handle);
    }

    fn send_message(&mut self, peer_url: &str, msg: &Message, handle: &EngineHandle) {
        let Some(entry) = self.peers.get(peer_url) else { return };
        match msg.encode() {
            Ok(bytes) => {
                self.metrics.record_bytes_gossiped(bytes.len() as u64);
                if entry.outbox.send(OutboundFrame::Send(bytes)).is_err() {
                    handle.try_send(Event::PeerDisconnect { peer_url: peer_url.to_string() });
                }
            }
            Err(e) => tracing::error!(peer = %peer_url, error = %e, "failed to encode message"),
        }
    }

    async fn persist_state(&mut self) {
        let mut peer_urls: Vec<String> = self.peers.keys().cloned().collect();
        peer_urls.sort();
        let persisted = PersistedState {
            node_sequences: self.node_sequences.clone(),
            timestamp: self.timestamp,
            peer_urls,
        };
        let bytes = match serde_json::to_vec(&persisted) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize engine state");
                return;
            }
        };
        if self.last_saved_state.as_deref() == Some(bytes.as_slice()) {
            return;
        }
        let save = self.storage.save_state(&bytes);
        if let Err(e) = self.with_storage_timeout(save).await {
            tracing::error!(error = %e, "failed to persist engine state");
            return;
        }
        self.last_saved_state = Some(bytes);
    }
}

/// Validates an inbound handshake token, returning the claimed identity.
pub fn validate_handshake(token: &str, jwt_secret: &str) -> AppResult<(String, String)> {
    auth::validate_token(token, jwt_secret)
}
