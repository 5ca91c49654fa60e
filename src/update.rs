//! The immutable replication record and its conflict ordering (spec §3).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::clock::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    DeleteRecord,
    UpsertRecord,
    CreateDatabase,
    DropDatabase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStream {
    pub stream_id: u8,
    pub data: Vec<u8>,
}

/// A single replication event. The engine never interprets `data_streams`;
/// it is opaque payload handed to the storage adapter verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub node_id: u64,
    pub sequence_no: u64,
    pub timestamp: Timestamp,
    pub update_type: UpdateType,
    pub record_id: String,
    pub database_name: String,
    pub data_streams: Vec<DataStream>,
}

impl Update {
    /// `(node_id, sequence_no)` is the primary identity for deduplication.
    pub fn identity(&self) -> (u64, u64) {
        (self.node_id, self.sequence_no)
    }

    pub fn key(&self) -> (&str, &str) {
        (self.database_name.as_str(), self.record_id.as_str())
    }

    /// Conflict ordering for two updates on the same `(database_name,
    /// record_id)`: greater timestamp wins; tie broken by lexicographic
    /// `record_id`; further tie broken by the smaller `node_id` (spec §3).
    /// Returns `Ordering::Greater` if `self` should win over `other`.
    pub fn conflict_cmp(&self, other: &Update) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.record_id.cmp(&other.record_id))
            .then_with(|| other.node_id.cmp(&self.node_id))
    }

    /// True iff `self` should overwrite `other` under the conflict ordering.
    pub fn beats(&self, other: &Update) -> bool {
        self.conflict_cmp(other) == Ordering::Greater
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(node_id: u64, record_id: &str, ts: Timestamp) -> Update {
        Update {
            node_id,
            sequence_no: 1,
            timestamp: ts,
            update_type: UpdateType::UpsertRecord,
            record_id: record_id.to_string(),
            database_name: "db1".to_string(),
            data_streams: vec![],
        }
    }

    #[test]
    fn greater_timestamp_wins() {
        let u1 = update(1, "r1", Timestamp::new(1000, 1));
        let u2 = update(1, "r1", Timestamp::new(1000, 2));
        assert!(u2.beats(&u1));
        assert!(!u1.beats(&u2));
    }

    #[test]
    fn tie_break_by_record_id_lexicographic() {
        let ts = Timestamp::new(1000, 1);
        let u1 = update(1, "a", ts);
        let u2 = update(1, "b", ts);
        assert!(u2.beats(&u1));
    }

    #[test]
    fn tie_break_by_smaller_node_id() {
        let ts = Timestamp::new(1000, 1);
        let u_node7 = update(7, "r1", ts);
        let u_node3 = update(3, "r1", ts);
        assert!(u_node3.beats(&u_node7));
        assert!(!u_node7.beats(&u_node3));
    }

    #[test]
    fn identical_updates_do_not_beat_each_other() {
        let ts = Timestamp::new(1000, 1);
        let a = update(1, "r1", ts);
        let b = update(1, "r1", ts);
        assert!(!a.beats(&b));
        assert!(!b.beats(&a));
    }
}
