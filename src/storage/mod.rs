//! Storage adapter contract — the engine's sole collaborator for
//! durability and conflict arbitration.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::sequences::NodeSequences;
use crate::update::{DataStream, Update};

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn commit_updates(&self, updates: &[Update]) -> AppResult<()>;

    /// All locally committed updates `u` with `since.before(u.node_id,
    /// u.sequence_no)`, capped at `max_results`, plus whether more remain.
    async fn get_updates_since(
        &self,
        since: &NodeSequences,
        max_results: i32,
    ) -> AppResult<(Vec<Update>, bool)>;

    /// Defaults to `Update::beats`'s ordering; adapters may override for
    /// application-specific tie-breaking as long as it remains total.
    async fn resolve_conflict(&self, u1: Update, u2: Update) -> AppResult<Update> {
        if u1.beats(&u2) {
            Ok(u1)
        } else {
            Ok(u2)
        }
    }

    async fn database_exists(&self, database_name: &str) -> AppResult<bool>;

    async fn get_record(
        &self,
        database_name: &str,
        record_id: &str,
    ) -> AppResult<Option<Vec<DataStream>>>;

    async fn save_state(&self, bytes: &[u8]) -> AppResult<()>;

    async fn load_state(&self) -> AppResult<Option<Vec<u8>>>;
}
