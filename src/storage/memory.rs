//! In-memory storage adapter used by tests and by the in-process multi-node
//! scenarios in `tests/`. Mirrors the shape of `storage::sqlite` but keeps
//! everything in a `tokio::sync::RwLock`-guarded set of maps.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::error::AppResult;
use crate::sequences::NodeSequences;
use crate::storage::StorageAdapter;
use crate::update::{DataStream, Update, UpdateType};

#[derive(Default)]
struct Inner {
    databases: HashSet<String>,
    /// Winning update per (database_name, record_id); absent after a delete.
    records: HashMap<(String, String), Update>,
    /// All committed updates in commit order, used to answer
    /// `get_updates_since`.
    log: Vec<Update>,
    state: Option<Vec<u8>>,
}

pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::default()) }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn commit_updates(&self, updates: &[Update]) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        for update in updates {
            match update.update_type {
                UpdateType::CreateDatabase => {
                    inner.databases.insert(update.database_name.clone());
                }
                UpdateType::DropDatabase => {
                    inner.databases.remove(&update.database_name);
                    inner
                        .records
                        .retain(|(db, _), _| db != &update.database_name);
                }
                UpdateType::UpsertRecord => {
                    let key = (update.database_name.clone(), update.record_id.clone());
                    let keep = match inner.records.get(&key) {
                        Some(existing) if !update.beats(existing) => false,
                        _ => true,
                    };
                    if keep {
                        inner.records.insert(key, update.clone());
                    }
                }
                UpdateType::DeleteRecord => {
                    let key = (update.database_name.clone(), update.record_id.clone());
                    let should_delete = match inner.records.get(&key) {
                        Some(existing) if !update.beats(existing) => false,
                        _ => true,
                    };
                    if should_delete {
                        inner.records.remove(&key);
                    }
                }
            }
            inner.log.push(update.clone());
        }
        inner.log.sort_by_key(|u| (u.node_id, u.sequence_no));
        inner.log.dedup_by_key(|u| (u.node_id, u.sequence_no));
        Ok(())
    }

    async fn get_updates_since(
        &self,
        since: &NodeSequences,
        max_results: i32,
    ) -> AppResult<(Vec<Update>, bool)> {
        let inner = self.inner.read().await;
        let matching: Vec<&Update> = inner
            .log
            .iter()
            .filter(|u| since.before(u.node_id, u.sequence_no))
            .collect();

        let max_results = max_results.max(0) as usize;
        let has_more = matching.len() > max_results;
        let page = matching
            .into_iter()
            .take(max_results)
            .cloned()
            .collect();
        Ok((page, has_more))
    }

    async fn database_exists(&self, database_name: &str) -> AppResult<bool> {
        Ok(self.inner.read().await.databases.contains(database_name))
    }

    async fn get_record(
        &self,
        database_name: &str,
        record_id: &str,
    ) -> AppResult<Option<Vec<DataStream>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .get(&(database_name.to_string(), record_id.to_string()))
            .map(|u| u.data_streams.clone()))
    }

    async fn save_state(&self, bytes: &[u8]) -> AppResult<()> {
        self.inner.write().await.state = Some(bytes.to_vec());
        Ok(())
    }

    async fn load_state(&self) -> AppResult<Option<Vec<u8>>> {
        Ok(self.inner.read().await.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;

    fn upsert(node_id: u64, seq: u64, db: &str, record: &str, ts: Timestamp, v: &str) -> Update {
        Update {
            node_id,
            sequence_no: seq,
            timestamp: ts,
            update_type: UpdateType::UpsertRecord,
            record_id: record.to_string(),
            database_name: db.to_string(),
            data_streams: vec![DataStream { stream_id: 0, data: v.as_bytes().to_vec() }],
        }
    }

    fn create_db(node_id: u64, seq: u64, db: &str, ts: Timestamp) -> Update {
        Update {
            node_id,
            sequence_no: seq,
            timestamp: ts,
            update_type: UpdateType::CreateDatabase,
            record_id: String::new(),
            database_name: db.to_string(),
            data_streams: vec![],
        }
    }

    #[tokio::test]
    async fn commit_then_read_record() {
        let storage = MemoryStorage::new();
        let ts = Timestamp::new(1000, 1);
        storage.commit_updates(&[create_db(0, 1, "db1", ts)]).await.unwrap();
        storage
            .commit_updates(&[upsert(0, 2, "db1", "r1", ts.next(1000), "v1")])
            .await
            .unwrap();

        assert!(storage.database_exists("db1").await.unwrap());
        let record = storage.get_record("db1", "r1").await.unwrap().unwrap();
        assert_eq!(record[0].data, b"v1");
    }

    #[tokio::test]
    async fn conflicting_writes_resolved_by_timestamp() {
        let storage = MemoryStorage::new();
        storage
            .commit_updates(&[create_db(0, 1, "db1", Timestamp::new(0, 0))])
            .await
            .unwrap();

        let older = upsert(1, 1, "db1", "r1", Timestamp::new(1000, 1), "old");
        let newer = upsert(1, 2, "db1", "r1", Timestamp::new(1000, 2), "new");

        // Apply out of causal order: newer arrives first.
        storage.commit_updates(&[newer]).await.unwrap();
        storage.commit_updates(&[older]).await.unwrap();

        let record = storage.get_record("db1", "r1").await.unwrap().unwrap();
        assert_eq!(record[0].data, b"new");
    }

    #[tokio::test]
    async fn get_updates_since_pages_and_reports_has_more() {
        let storage = MemoryStorage::new();
        storage
            .commit_updates(&[create_db(0, 0, "db1", Timestamp::ZERO)])
            .await
            .unwrap();
        let mut updates = Vec::new();
        for seq in 1..=250u64 {
            updates.push(upsert(0, seq, "db1", &format!("r{seq}"), Timestamp::new(seq as i64, seq as i64), "v"));
        }
        storage.commit_updates(&updates).await.unwrap();

        let mut since = NodeSequences::new();
        let (page1, more1) = storage.get_updates_since(&since, 100).await.unwrap();
        assert_eq!(page1.len(), 100);
        assert!(more1);
        since.update(0, page1.last().unwrap().sequence_no);

        let (page2, more2) = storage.get_updates_since(&since, 100).await.unwrap();
        assert_eq!(page2.len(), 100);
        assert!(more2);
        since.update(0, page2.last().unwrap().sequence_no);

        let (page3, more3) = storage.get_updates_since(&since, 100).await.unwrap();
        assert_eq!(page3.len(), 50);
        assert!(!more3);
        since.update(0, page3.last().unwrap().sequence_no);
        assert_eq!(since.get(0), Some(250));
    }

    #[tokio::test]
    async fn idempotent_apply() {
        let storage = MemoryStorage::new();
        let ts = Timestamp::new(10, 1);
        storage.commit_updates(&[create_db(0, 1, "db1", ts)]).await.unwrap();
        let u = upsert(0, 2, "db1", "r1", ts.next(10), "v1");
        storage.commit_updates(&[u.clone()]).await.unwrap();
        storage.commit_updates(&[u]).await.unwrap();

        let record = storage.get_record("db1", "r1").await.unwrap().unwrap();
        assert_eq!(record[0].data, b"v1");
        let (all, _) = storage.get_updates_since(&NodeSequences::new(), 1000).await.unwrap();
        assert_eq!(all.iter().filter(|u| u.database_name == "db1" && u.record_id == "r1").count(), 1);
    }
}
