//! Dependency buffer (spec §4.5): updates staged because their database's
//! `CreateDatabase` has not been seen locally yet. Also reused, per spec
//! §7, as the generic retry staging area for updates whose storage commit
//! failed transiently.

use std::collections::{HashMap, HashSet};

use crate::update::{Update, UpdateType};

#[derive(Debug, Default)]
pub struct DependencyBuffer {
    buffers: HashMap<String, Vec<Update>>,
    /// Databases that have already crossed the warn threshold, so we log
    /// once per crossing rather than once per insert.
    warned: HashSet<String>,
}

impl DependencyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: Update, warn_threshold: usize) {
        let db = update.database_name.clone();
        let entry = self.buffers.entry(db.clone()).or_default();
        entry.push(update);
        if entry.len() > warn_threshold && !self.warned.contains(&db) {
            tracing::warn!(
                database = %db,
                count = entry.len(),
                "dependency buffer exceeds warn threshold"
            );
            self.warned.insert(db);
        }
    }

    /// Removes and returns every update buffered for `database_name`, in
    /// insertion order.
    pub fn drain(&mut self, database_name: &str) -> Vec<Update> {
        self.warned.remove(database_name);
        self.buffers.remove(database_name).unwrap_or_default()
    }

    pub fn databases(&self) -> Vec<String> {
        self.buffers.keys().cloned().collect()
    }

    /// True if the oldest buffered entry for `database_name` is itself a
    /// `CreateDatabase` that failed to commit — the sweep should still
    /// retry it even though `database_exists` will report `false`.
    pub fn front_is_create_database(&self, database_name: &str) -> bool {
        self.buffers
            .get(database_name)
            .and_then(|v| v.first())
            .map(|u| u.update_type == UpdateType::CreateDatabase)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.values().all(|v| v.is_empty())
    }

    pub fn len_for(&self, database_name: &str) -> usize {
        self.buffers.get(database_name).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;

    fn upsert(db: &str, record: &str) -> Update {
        Update {
            node_id: 1,
            sequence_no: 1,
            timestamp: Timestamp::new(1, 1),
            update_type: UpdateType::UpsertRecord,
            record_id: record.to_string(),
            database_name: db.to_string(),
            data_streams: vec![],
        }
    }

    fn create_db(db: &str) -> Update {
        Update {
            node_id: 1,
            sequence_no: 1,
            timestamp: Timestamp::new(1, 1),
            update_type: UpdateType::CreateDatabase,
            record_id: String::new(),
            database_name: db.to_string(),
            data_streams: vec![],
        }
    }

    #[test]
    fn buffers_stay_in_insertion_order_and_drain_together() {
        let mut buf = DependencyBuffer::new();
        buf.push(upsert("db1", "r1"), 10_000);
        buf.push(upsert("db1", "r2"), 10_000);
        buf.push(upsert("db2", "r1"), 10_000);

        let db1 = buf.drain("db1");
        assert_eq!(db1.len(), 2);
        assert_eq!(db1[0].record_id, "r1");
        assert_eq!(db1[1].record_id, "r2");
        assert_eq!(buf.len_for("db2"), 1);
        assert!(buf.drain("db1").is_empty());
    }

    #[test]
    fn front_is_create_database_detects_pending_create() {
        let mut buf = DependencyBuffer::new();
        buf.push(create_db("db1"), 10_000);
        buf.push(upsert("db1", "r1"), 10_000);
        assert!(buf.front_is_create_database("db1"));
        buf.drain("db1");
        assert!(!buf.front_is_create_database("db1"));
    }

    #[test]
    fn warns_only_once_past_threshold() {
        let mut buf = DependencyBuffer::new();
        for i in 0..5 {
            buf.push(upsert("db1", &format!("r{i}")), 2);
        }
        assert_eq!(buf.len_for("db1"), 5);
    }
}
