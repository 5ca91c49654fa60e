//! Per-origin progress vector: "how far am I caught up with each peer?"
//! `get` returns `Option<u64>`, never a sentinel, so "never seen this
//! node" and "seen at sequence 0" stay distinguishable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSequences {
    sequences: HashMap<u64, u64>,
}

impl NodeSequences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: u64) -> Option<u64> {
        self.sequences.get(&node_id).copied()
    }

    /// Raises the stored sequence for `node_id` to `max(current, seq)`.
    pub fn update(&mut self, node_id: u64, seq: u64) {
        let entry = self.sequences.entry(node_id).or_insert(0);
        *entry = (*entry).max(seq);
    }

    /// True iff we have not seen `node_id` at all, or our stored sequence
    /// for it is strictly less than `seq` — i.e. `seq` is still ahead of us.
    pub fn before(&self, node_id: u64, seq: u64) -> bool {
        match self.get(node_id) {
            None => true,
            Some(stored) => seq > stored,
        }
    }

    /// Merge another vector into this one, taking the pointwise maximum.
    pub fn merge(&mut self, other: &NodeSequences) {
        for (&node_id, &seq) in &other.sequences {
            self.update(node_id, seq);
        }
    }

    /// Node ids where `other` claims to be strictly ahead of `self` — the
    /// set gossip uses to decide whether to issue an update request.
    pub fn nodes_behind(&self, other: &NodeSequences) -> Vec<u64> {
        other
            .sequences
            .iter()
            .filter(|&(&node_id, &seq)| self.before(node_id, seq))
            .map(|(&node_id, _)| node_id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.sequences.iter().map(|(&k, &v)| (k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_option_never_sentinel() {
        let seqs = NodeSequences::new();
        assert_eq!(seqs.get(7), None);
    }

    #[test]
    fn update_takes_the_max() {
        let mut seqs = NodeSequences::new();
        seqs.update(1, 5);
        seqs.update(1, 3);
        assert_eq!(seqs.get(1), Some(5));
        seqs.update(1, 9);
        assert_eq!(seqs.get(1), Some(9));
    }

    #[test]
    fn before_is_true_when_unknown_or_strictly_ahead() {
        let mut seqs = NodeSequences::new();
        assert!(seqs.before(1, 1));
        seqs.update(1, 5);
        assert!(!seqs.before(1, 5));
        assert!(!seqs.before(1, 4));
        assert!(seqs.before(1, 6));
    }

    #[test]
    fn nodes_behind_reports_ids_where_peer_is_ahead() {
        let mut local = NodeSequences::new();
        local.update(1, 10);
        local.update(2, 3);

        let mut remote = NodeSequences::new();
        remote.update(1, 10);
        remote.update(2, 8);
        remote.update(3, 1);

        let mut behind = local.nodes_behind(&remote);
        behind.sort();
        assert_eq!(behind, vec![2, 3]);
    }

    #[test]
    fn get_is_monotonically_non_decreasing_over_updates() {
        let mut seqs = NodeSequences::new();
        let mut last = 0;
        for seq in [3, 1, 7, 2, 20] {
            seqs.update(42, seq);
            let current = seqs.get(42).unwrap();
            assert!(current >= last);
            last = current;
        }
        assert_eq!(last, 20);
    }
}
