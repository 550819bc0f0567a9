//! Redis task store.
//!
//! Each task lives under `task:{id}` as a JSON document. Enumeration uses
//! `SCAN MATCH task:*`, so no secondary index is kept.
//!
//! Uses `redis::aio::ConnectionManager` for a multiplexed connection with
//! automatic reconnection.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::traits::TaskStore;
use crate::tasks::model::{TaskId, TaskRecord};

/// Key prefix for task records.
const KEY_PREFIX: &str = "task:";

/// Keys requested per SCAN round trip.
const SCAN_BATCH: usize = 100;

/// Redis-backed store shared by every process pointing at the same server.
#[derive(Clone)]
pub struct RedisTaskStore {
    connection_manager: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTaskStore")
            .field("connection_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisTaskStore {
    /// Connect to the server at `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {e}")))?;

        let connection_manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to Redis: {e}")))?;

        info!(url = %redact_url(url), "Redis task store connected");
        Ok(Self { connection_manager })
    }

    /// Round-trip a PING to verify the connection.
    pub async fn health_check(&self) -> Result<bool, StoreError> {
        let mut conn = self.connection_manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Redis PING failed: {e}")))?;
        Ok(pong == "PONG")
    }
}

impl RedisTaskStore {
    /// Walk every `task:*` key, splitting decodable records from corrupt ones.
    async fn scan(&self) -> Result<ScanBatch, StoreError> {
        let mut conn = self.connection_manager.clone();
        let pattern = format!("{KEY_PREFIX}*");
        let mut batch = ScanBatch::default();
        let mut cursor: u64 = 0;

        // SCAN guarantees every key present for the whole iteration is returned.
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(format!("Redis SCAN failed: {e}")))?;

            if !keys.is_empty() {
                let values: Vec<Option<String>> = redis::cmd("MGET")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Unavailable(format!("Redis MGET failed: {e}")))?;
                batch.absorb(&keys, values);
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(batch)
    }
}

/// Result of one full keyspace scan.
#[derive(Debug, Default)]
struct ScanBatch {
    records: Vec<(TaskId, TaskRecord)>,
    corrupt: Vec<TaskId>,
}

impl ScanBatch {
    /// Sort one MGET reply into decodable and corrupt entries.
    fn absorb(&mut self, keys: &[String], values: Vec<Option<String>>) {
        for (key, value) in keys.iter().zip(values) {
            // Deleted between SCAN and MGET.
            let Some(json) = value else { continue };
            let Some(id) = parse_task_key(key) else {
                debug!(key = %key, "Skipping non-task key");
                continue;
            };
            match decode(key, &json) {
                Ok(record) => self.records.push((id, record)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable task record");
                    self.corrupt.push(id);
                }
            }
        }
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn put(&self, id: TaskId, record: &TaskRecord) -> Result<(), StoreError> {
        let payload = encode(record)?;
        let mut conn = self.connection_manager.clone();

        redis::cmd("SET")
            .arg(task_key(id))
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Redis SET failed: {e}")))?;

        debug!(task_id = %id, status = %record.status, "Task stored in Redis");
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let key = task_key(id);
        let mut conn = self.connection_manager.clone();

        let raw: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Redis GET failed: {e}")))?;

        raw.map(|json| decode(&key, &json)).transpose()
    }

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();

        redis::cmd("DEL")
            .arg(task_key(id))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Redis DEL failed: {e}")))?;

        debug!(task_id = %id, "Task deleted from Redis");
        Ok(())
    }

    async fn scan_all(&self) -> Result<Vec<(TaskId, TaskRecord)>, StoreError> {
        Ok(self.scan().await?.records)
    }

    async fn scan_corrupt(&self) -> Result<Vec<TaskId>, StoreError> {
        Ok(self.scan().await?.corrupt)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

fn task_key(id: TaskId) -> String {
    format!("{KEY_PREFIX}{id}")
}

fn parse_task_key(key: &str) -> Option<TaskId> {
    key.strip_prefix(KEY_PREFIX)?.parse().ok()
}

fn encode(record: &TaskRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(key: &str, json: &str) -> Result<TaskRecord, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Hide credentials in a connection URL before logging it.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
