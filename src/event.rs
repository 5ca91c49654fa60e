//! The event sum type the state machine drains from its bounded queue,
//! plus the handle producers use to post into it. No producer ever
//! touches engine state directly; everything is serialized through this
//! queue.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::AppResult;
use crate::sequences::NodeSequences;
use crate::transport::OutboundFrame;
use crate::update::Update;

pub enum Event {
    ReceivedUpdate {
        peer_url: String,
        update: Update,
    },
    GossipMessage {
        peer_url: String,
        node_id: String,
        known_peers: Vec<String>,
        last_sequences: NodeSequences,
    },
    UpdateRequest {
        peer_url: String,
        since: NodeSequences,
        max_results: i32,
    },
    BatchUpdate {
        peer_url: String,
        updates: Vec<Update>,
        has_more: bool,
    },
    AddPeer {
        url: String,
    },
    ConnectPeer {
        url: String,
    },
    /// The outcome of an outbound dial spawned off the loop by
    /// `ConnectPeer`, fed back once the (necessarily blocking) network
    /// handshake completes.
    DialOutcome {
        url: String,
        result: Result<(mpsc::UnboundedSender<OutboundFrame>, JoinHandle<()>), String>,
    },
    /// Posted by the HTTP layer once it has validated the peer's bearer
    /// token and upgraded the socket, and already spawned the connection
    /// actor for it.
    IncomingConnection {
        peer_node_id: String,
        peer_url: String,
        outbox: mpsc::UnboundedSender<OutboundFrame>,
        join: JoinHandle<()>,
    },
    SendGossip {
        peer_url: String,
    },
    /// Periodic fan-out trigger; the handler performs `SendGossip` for
    /// every peer it knows.
    GossipTick,
    PeerHeartbeat {
        peer_url: String,
        sequences: NodeSequences,
    },
    HeartbeatTick,
    PeerDisconnect {
        peer_url: String,
    },
    SubmitLocal {
        updates: Vec<Update>,
        reply: oneshot::Sender<AppResult<()>>,
    },
    PersistState,
    DependencySweep,
    UpdateRequestTimeout {
        peer_url: String,
    },
    /// Fired by `EngineState::schedule`'s timer once `delay` elapses. The
    /// loop clears `key` from the scheduled set *before* dispatching
    /// `inner`, which is what allows `inner`'s handler to re-schedule
    /// under the same key.
    ScheduledFire {
        key: String,
        inner: Box<Event>,
    },
    Shutdown,
}

/// Cloneable producer-side handle. Peers, HTTP handlers, and timers hold
/// only this — never a lock on engine state.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<Event>,
}

impl EngineHandle {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Must-not-drop producers (peer readers) block on enqueue.
    pub async fn send(&self, event: Event) {
        let _ = self.sender.send(event).await;
    }

    /// Periodic schedulers use this: drop on saturation, they'll re-fire.
    pub fn try_send(&self, event: Event) {
        let _ = self.sender.try_send(event);
    }

    /// Non-async convenience for call sites (e.g. the connection actor's
    /// final disconnect notification) that cannot await a full `send`.
    pub fn enqueue(&self, event: Event) {
        self.try_send(event);
    }

    pub async fn submit_local(&self, updates: Vec<Update>) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::SubmitLocal { updates, reply: tx }).await;
        rx.await
            .map_err(|_| crate::error::AppError::Internal("engine loop stopped".to_string()))?
    }
}
