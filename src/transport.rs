//! Peer transport (spec §4.3): a duplex, length-delimited binary frame
//! channel, realized over WebSockets. Inbound connections arrive already
//! upgraded from the axum handler in `server.rs`; outbound connections are
//! dialed here with `tokio-tungstenite`, attaching the bearer token during
//! the HTTP upgrade handshake. A `Transport` trait abstracts the duplex
//! channel so tests can substitute an in-process, socket-free double.

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use http::Request;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use crate::auth;
use crate::error::{AppError, AppResult};
use crate::event::{Event, EngineHandle};
use crate::wire::{Message, MessageContent};

/// One binary frame in, one binary frame out, no interpretation.
#[async_trait]
pub trait Transport: Send {
    /// `Ok(None)` signals a graceful close; `Err` signals a read failure.
    async fn read_frame(&mut self) -> AppResult<Option<Vec<u8>>>;
    async fn write_frame(&mut self, bytes: Vec<u8>) -> AppResult<()>;
    async fn close(&mut self);
}

/// Server-side transport: an axum WebSocket already upgraded by the HTTP
/// layer after validating the peer's bearer token.
pub struct AxumWsTransport {
    socket: WebSocket,
}

impl AxumWsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for AxumWsTransport {
    async fn read_frame(&mut self) -> AppResult<Option<Vec<u8>>> {
        loop {
            match self.socket.next().await {
                None => return Ok(None),
                Some(Ok(AxumMessage::Binary(bytes))) => return Ok(Some(bytes.to_vec())),
                Some(Ok(AxumMessage::Close(_))) => return Ok(None),
                Some(Ok(AxumMessage::Ping(_))) | Some(Ok(AxumMessage::Pong(_))) => continue,
                Some(Ok(AxumMessage::Text(_))) => {
                    return Err(AppError::Protocol("unexpected text frame".to_string()))
                }
                Some(Err(e)) => return Err(AppError::Transient(e.to_string())),
            }
        }
    }

    async fn write_frame(&mut self, bytes: Vec<u8>) -> AppResult<()> {
        self.socket
            .send(AxumMessage::Binary(bytes.into()))
            .await
            .map_err(|e| AppError::Transient(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.socket.close().await;
    }
}

/// Client-side transport: a dialed `tokio-tungstenite` stream.
pub struct TungsteniteTransport {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn read_frame(&mut self) -> AppResult<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(TungsteniteMessage::Binary(bytes))) => return Ok(Some(bytes.to_vec())),
                Some(Ok(TungsteniteMessage::Close(_))) => return Ok(None),
                Some(Ok(TungsteniteMessage::Ping(_))) | Some(Ok(TungsteniteMessage::Pong(_))) => {
                    continue
                }
                Some(Ok(TungsteniteMessage::Text(_))) => {
                    return Err(AppError::Protocol("unexpected text frame".to_string()))
                }
                Some(Ok(TungsteniteMessage::Frame(_))) => continue,
                Some(Err(e)) => return Err(AppError::Transient(e.to_string())),
            }
        }
    }

    async fn write_frame(&mut self, bytes: Vec<u8>) -> AppResult<()> {
        self.stream
            .send(TungsteniteMessage::Binary(bytes.into()))
            .await
            .map_err(|e| AppError::Transient(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// In-process transport double: a channel-backed pair that never touches a
/// real socket, used by integration tests to run multi-node scenarios
/// deterministically (SPEC_FULL §8).
pub struct InProcessTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl InProcessTransport {
    /// Returns a connected pair: frames written to one side are read from
    /// the other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        (Self { tx: tx_a, rx: rx_a }, Self { tx: tx_b, rx: rx_b })
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn read_frame(&mut self) -> AppResult<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }

    async fn write_frame(&mut self, bytes: Vec<u8>) -> AppResult<()> {
        self.tx
            .send(bytes)
            .map_err(|_| AppError::Transient("in-process peer gone".to_string()))
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Outbound frames submitted to a peer's connection task. `Close` is a
/// sentinel instructing the task to shut down its transport and exit.
pub enum OutboundFrame {
    Send(Vec<u8>),
    Close,
}

/// Spawns the actor task that owns `transport` exclusively: it drains
/// inbound frames and turns them into events, and drains `outbox` for
/// frames to write. Combining read and write in one task avoids needing
/// two independent `&mut` borrows of the transport.
pub fn spawn_connection(
    mut transport: Box<dyn Transport>,
    peer_url: String,
    handle: EngineHandle,
) -> (mpsc::UnboundedSender<OutboundFrame>, JoinHandle<()>) {
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = transport.read_frame() => {
                    match frame {
                        Ok(Some(bytes)) => {
                            match Message::decode(&bytes) {
                                Ok(msg) => dispatch_inbound(&handle, &peer_url, msg).await,
                                Err(e) => {
                                    tracing::warn!(peer = %peer_url, error = %e, "dropping undecodable frame");
                                }
                            }
                        }
                        Ok(None) => {
                            tracing::debug!(peer = %peer_url, "peer closed connection");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(peer = %peer_url, error = %e, "read failed, disconnecting");
                            break;
                        }
                    }
                }
                outbound = outbox_rx.recv() => {
                    match outbound {
                        Some(OutboundFrame::Send(bytes)) => {
                            if let Err(e) = transport.write_frame(bytes).await {
                                tracing::warn!(peer = %peer_url, error = %e, "write failed, disconnecting");
                                break;
                            }
                        }
                        Some(OutboundFrame::Close) | None => break,
                    }
                }
            }
        }
        transport.close().await;
        handle.send(Event::PeerDisconnect { peer_url: peer_url.clone() }).await;
    });
    (outbox_tx, join)
}

async fn dispatch_inbound(handle: &EngineHandle, peer_url: &str, msg: Message) {
    let peer_url = peer_url.to_string();
    let event = match msg.content {
        MessageContent::Gossip(g) => Event::GossipMessage {
            peer_url,
            node_id: g.node_id,
            known_peers: g.known_peers,
            last_sequences: g.last_sequences,
        },
        MessageContent::Update(update) => Event::ReceivedUpdate { peer_url, update },
        MessageContent::UpdateRequest(r) => Event::UpdateRequest {
            peer_url,
            since: r.since,
            max_results: r.max_results,
        },
        MessageContent::BatchUpdate(b) => Event::BatchUpdate {
            peer_url,
            updates: b.updates,
            has_more: b.has_more,
        },
        MessageContent::Heartbeat(h) => Event::PeerHeartbeat {
            peer_url,
            sequences: h.sequences,
        },
    };
    handle.send(event).await;
}

/// Dials `url`, performs the bearer-token handshake, and returns an outbox
/// handle for the spawned connection actor. Never blocks the state
/// machine's event loop: this is run from a detached task by the
/// `ConnectPeer` handler.
pub async fn dial(
    url: &str,
    own_node_id: u64,
    own_url: &str,
    jwt_secret: &str,
    handle: EngineHandle,
) -> Result<(mpsc::UnboundedSender<OutboundFrame>, JoinHandle<()>), String> {
    let token = auth::generate_token(&own_node_id.to_string(), own_url, jwt_secret)
        .map_err(|e| format!("failed to mint handshake token: {}", e))?;

    let request = Request::builder()
        .uri(url)
        .header("Authorization", format!("Bearer {}", token))
        .body(())
        .map_err(|e| format!("invalid peer url {}: {}", url, e))?;

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| format!("failed to connect to {}: {}", url, e))?;

    let transport: Box<dyn Transport> = Box::new(TungsteniteTransport { stream });
    Ok(spawn_connection(transport, url.to_string(), handle))
}
