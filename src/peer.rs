//! Peer table entries (spec §3). Owned exclusively by the state machine;
//! never touched from reader/writer tasks directly.

use std::time::Instant;

use crate::sequences::NodeSequences;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub url: String,
    pub display_name: Option<String>,
    pub connection_state: ConnectionState,
    pub last_active: Instant,
    /// Our estimate of what this peer has applied, refreshed from its
    /// gossip/heartbeat messages.
    pub last_known_sequences: NodeSequences,
}

impl Peer {
    pub fn new_connected(url: String) -> Self {
        Self {
            url,
            display_name: None,
            connection_state: ConnectionState::Connected,
            last_active: Instant::now(),
            last_known_sequences: NodeSequences::new(),
        }
    }
}

/// At most one in flight per peer (spec invariant #5).
#[derive(Debug, Clone)]
pub struct PendingUpdateRequest {
    pub peer_url: String,
    pub since_sequences: NodeSequences,
    pub in_progress: bool,
}
