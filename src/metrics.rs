//! Ambient replication counters: not part of the wire protocol, purely
//! in-process observability for operators.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MetricsCollector {
    updates_applied: AtomicU64,
    conflicts_resolved: AtomicU64,
    bytes_gossiped: AtomicU64,
    peers_connected: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_update_applied(&self) {
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict_resolved(&self) {
        self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_gossiped(&self, bytes: u64) {
        self.bytes_gossiped.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_peer_connected(&self) {
        self.peers_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_disconnected(&self) {
        self.peers_connected.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            bytes_gossiped: self.bytes_gossiped.load(Ordering::Relaxed),
            peers_connected: self.peers_connected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub updates_applied: u64,
    pub conflicts_resolved: u64,
    pub bytes_gossiped: u64,
    pub peers_connected: u64,
}
