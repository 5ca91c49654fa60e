//! SQLite-backed storage adapter: connection pooling via `sqlx`, explicit
//! `CREATE TABLE`/index statements run once at startup.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::error::{AppError, AppResult};
use crate::sequences::NodeSequences;
use crate::storage::StorageAdapter;
use crate::update::{DataStream, Update};

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn new_in_memory() -> AppResult<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| AppError::Storage(format!("failed to open in-memory sqlite: {}", e)))?;
        let storage = Self { pool };
        storage.initialize().await?;
        Ok(storage)
    }

    pub async fn new(url: &str) -> AppResult<Self> {
        let pool = SqlitePool::connect(url)
            .await
            .map_err(|e| AppError::Storage(format!("failed to open sqlite at {}: {}", url, e)))?;
        let storage = Self { pool };
        storage.initialize().await?;
        Ok(storage)
    }

    async fn initialize(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS databases (
                name TEXT PRIMARY KEY
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("failed to create databases table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                database_name TEXT NOT NULL,
                record_id TEXT NOT NULL,
                unix_millis INTEGER NOT NULL,
                lamport INTEGER NOT NULL,
                origin_node_id INTEGER NOT NULL,
                data_streams BLOB NOT NULL,
                PRIMARY KEY (database_name, record_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("failed to create records table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS update_log (
                node_id INTEGER NOT NULL,
                sequence_no INTEGER NOT NULL,
                update_blob BLOB NOT NULL,
                PRIMARY KEY (node_id, sequence_no)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("failed to create update_log table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engine_state (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                state BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("failed to create engine_state table: {}", e)))?;

        Ok(())
    }

    async fn current_winner(&self, database_name: &str, record_id: &str) -> AppResult<Option<Update>> {
        let row = sqlx::query(
            "SELECT unix_millis, lamport, origin_node_id, data_streams FROM records WHERE database_name = ? AND record_id = ?",
        )
        .bind(database_name)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("failed to read record: {}", e)))?;

        let Some(row) = row else { return Ok(None) };
        let data_streams: Vec<u8> = row.get("data_streams");
        let data_streams: Vec<DataStream> = bincode::deserialize(&data_streams)
            .map_err(|e| AppError::Storage(format!("corrupt record payload: {}", e)))?;

        Ok(Some(Update {
            node_id: row.get::<i64, _>("origin_node_id") as u64,
            sequence_no: 0,
            timestamp: crate::clock::Timestamp::new(row.get("unix_millis"), row.get("lamport")),
            update_type: crate::update::UpdateType::UpsertRecord,
            record_id: record_id.to_string(),
            database_name: database_name.to_string(),
            data_streams,
        }))
    }
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn commit_updates(&self, updates: &[Update]) -> AppResult<()> {
        for update in updates {
            let blob = bincode::serialize(update)
                .map_err(|e| AppError::Storage(format!("failed to encode update: {}", e)))?;

            sqlx::query(
                "INSERT OR IGNORE INTO update_log (node_id, sequence_no, update_blob) VALUES (?, ?, ?)",
            )
            .bind(update.node_id as i64)
            .bind(update.sequence_no as i64)
            .bind(blob)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("failed to append update log: {}", e)))?;

            use crate::update::UpdateType::*;
            match update.update_type {
                CreateDatabase => {
                    sqlx::query("INSERT OR IGNORE INTO databases (name) VALUES (?)")
                        .bind(&update.database_name)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| AppError::Storage(format!("failed to create database: {}", e)))?;
                }
                DropDatabase => {
                    sqlx::query("DELETE FROM databases WHERE name = ?")
                        .bind(&update.database_name)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| AppError::Storage(format!("failed to drop database: {}", e)))?;
                    sqlx::query("DELETE FROM records WHERE database_name = ?")
                        .bind(&update.database_name)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| AppError::Storage(format!("failed to drop database records: {}", e)))?;
                }
                UpsertRecord => {
                    let winner_stays = match self.current_winner(&update.database_name, &update.record_id).await? {
                        Some(existing) => update.beats(&existing),
                        None => true,
                    };
                    if winner_stays {
                        let data_streams = bincode::serialize(&update.data_streams)
                            .map_err(|e| AppError::Storage(format!("failed to encode data streams: {}", e)))?;
                        sqlx::query(
                            "INSERT OR REPLACE INTO records (database_name, record_id, unix_millis, lamport, origin_node_id, data_streams) VALUES (?, ?, ?, ?, ?, ?)",
                        )
                        .bind(&update.database_name)
                        .bind(&update.record_id)
                        .bind(update.timestamp.unix_millis)
                        .bind(update.timestamp.lamport)
                        .bind(update.node_id as i64)
                        .bind(data_streams)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| AppError::Storage(format!("failed to upsert record: {}", e)))?;
                    }
                }
                DeleteRecord => {
                    let winner_stays = match self.current_winner(&update.database_name, &update.record_id).await? {
                        Some(existing) => update.beats(&existing),
                        None => true,
                    };
                    if winner_stays {
                        sqlx::query("DELETE FROM records WHERE database_name = ? AND record_id = ?")
                            .bind(&update.database_name)
                            .bind(&update.record_id)
                            .execute(&self.pool)
                            .await
                            .map_err(|e| AppError::Storage(format!("failed to delete record: {}", e)))?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn get_updates_since(
        &self,
        since: &NodeSequences,
        max_results: i32,
    ) -> AppResult<(Vec<Update>, bool)> {
        let max_results = max_results.max(0) as i64;
        let rows = sqlx::query(
            "SELECT update_blob FROM update_log ORDER BY node_id, sequence_no",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("failed to scan update log: {}", e)))?;

        let mut matching = Vec::new();
        for row in rows {
            let blob: Vec<u8> = row.get("update_blob");
            let update: Update = bincode::deserialize(&blob)
                .map_err(|e| AppError::Storage(format!("corrupt update log entry: {}", e)))?;
            if since.before(update.node_id, update.sequence_no) {
                matching.push(update);
            }
        }

        let has_more = matching.len() as i64 > max_results;
        matching.truncate(max_results as usize);
        Ok((matching, has_more))
    }

    async fn database_exists(&self, database_name: &str) -> AppResult<bool> {
        let row = sqlx::query("SELECT 1 FROM databases WHERE name = ?")
            .bind(database_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("failed to check database existence: {}", e)))?;
        Ok(row.is_some())
    }

    async fn get_record(
        &self,
        database_name: &str,
        record_id: &str,
    ) -> AppResult<Option<Vec<DataStream>>> {
        Ok(self
            .current_winner(database_name, record_id)
            .await?
            .map(|u| u.data_streams))
    }

    async fn save_state(&self, bytes: &[u8]) -> AppResult<()> {
        sqlx::query("INSERT OR REPLACE INTO engine_state (id, state) VALUES (0, ?)")
            .bind(bytes)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("failed to save engine state: {}", e)))?;
        Ok(())
    }

    async fn load_state(&self) -> AppResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT state FROM engine_state WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Storage(format!("failed to load engine state: {}", e)))?;
        Ok(row.map(|r| r.get("state")))
    }
}
