//! libSQL task store: one row per task holding the JSON record.
//!
//! Works with a local file or an in-memory database. The `updated_at`
//! column mirrors the record so retention scans can be inspected in SQL.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::tasks::model::{TaskId, TaskRecord};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Task database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// A row as read back from `task_records`.
enum StoredRow {
    Valid(TaskId, TaskRecord),
    /// Id parses but the record JSON does not.
    Corrupt(TaskId, String),
    /// Id column is not a task id at all.
    Foreign(String),
}

fn read_row(row: &libsql::Row) -> Result<StoredRow, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Unavailable(format!("task row read: {e}")))?;
    let json: String = row
        .get(1)
        .map_err(|e| StoreError::Unavailable(format!("task row read: {e}")))?;

    let Ok(id) = id_str.parse::<TaskId>() else {
        return Ok(StoredRow::Foreign(id_str));
    };
    Ok(match serde_json::from_str::<TaskRecord>(&json) {
        Ok(record) => StoredRow::Valid(id, record),
        Err(e) => StoredRow::Corrupt(id, e.to_string()),
    })
}

fn row_to_record(row: &libsql::Row) -> Result<TaskRecord, StoreError> {
    match read_row(row)? {
        StoredRow::Valid(_, record) => Ok(record),
        StoredRow::Corrupt(id, reason) => Err(StoreError::Corrupt {
            key: id.to_string(),
            reason,
        }),
        StoredRow::Foreign(key) => Err(StoreError::Corrupt {
            key,
            reason: "id is not a task id".to_string(),
        }),
    }
}

impl LibSqlTaskStore {
    async fn scan_rows(&self) -> Result<Vec<StoredRow>, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT id, record FROM task_records", ())
            .await
            .map_err(|e| StoreError::Unavailable(format!("scan_tasks: {e}")))?;

        let mut stored = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => stored.push(read_row(&row)?),
                Ok(None) => break,
                Err(e) => return Err(StoreError::Unavailable(format!("scan_tasks: {e}"))),
            }
        }
        Ok(stored)
    }

    /// Write raw JSON under `id`, bypassing serialization.
    #[cfg(test)]
    pub(crate) async fn put_raw(&self, id: &str, json: &str) {
        self.conn()
            .execute(
                "INSERT INTO task_records (id, record, updated_at) VALUES (?1, ?2, '')",
                params![id.to_string(), json.to_string()],
            )
            .await
            .unwrap();
    }
}

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn put(&self, id: TaskId, record: &TaskRecord) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO task_records (id, record, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at",
                params![id.to_string(), json, record.updated_at.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Unavailable(format!("put_task: {e}")))?;

        debug!(task_id = %id, status = %record.status, "Task stored in DB");
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, record FROM task_records WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Unavailable(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_record(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Unavailable(format!("get_task: {e}"))),
        }
    }

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "DELETE FROM task_records WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Unavailable(format!("delete_task: {e}")))?;

        debug!(task_id = %id, "Task deleted from DB");
        Ok(())
    }

    async fn scan_all(&self) -> Result<Vec<(TaskId, TaskRecord)>, StoreError> {
        let mut records = Vec::new();
        for row in self.scan_rows().await? {
            match row {
                StoredRow::Valid(id, record) => records.push((id, record)),
                StoredRow::Corrupt(id, reason) => {
                    warn!(task_id = %id, reason = %reason, "Skipping undecodable task row");
                }
                StoredRow::Foreign(key) => warn!(key = %key, "Skipping task row with invalid id"),
            }
        }
        Ok(records)
    }

    async fn scan_corrupt(&self) -> Result<Vec<TaskId>, StoreError> {
        Ok(self
            .scan_rows()
            .await?
            .into_iter()
            .filter_map(|row| match row {
                StoredRow::Corrupt(id, _) => Some(id),
                _ => None,
            })
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "libsql"
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::tasks::model::TaskStatus;

    async fn test_store() -> LibSqlTaskStore {
        LibSqlTaskStore::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn put_and_get() {
        let store = test_store().await;
        let id = TaskId::new();
        let record = TaskRecord::pending(id, Utc::now());

        store.put(id, &record).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn get_not_found() {
        let store = test_store().await;
        assert!(store.get(TaskId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites() {
        let store = test_store().await;
        let id = TaskId::new();
        let now = Utc::now();
        let record = TaskRecord::pending(id, now);
        store.put(id, &record).await.unwrap();

        let processing = record
            .transitioned(TaskStatus::Processing, None, None, now)
            .unwrap();
        let done = processing
            .transitioned(TaskStatus::Completed, Some("/uploads/converts/a.html".into()), None, now)
            .unwrap();
        store.put(id, &done).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result.as_deref(), Some("/uploads/converts/a.html"));
        assert_eq!(store.scan_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_and_scan() {
        let store = test_store().await;
        let now = Utc::now();
        let keep = TaskId::new();
        let drop_id = TaskId::new();
        store.put(keep, &TaskRecord::pending(keep, now)).await.unwrap();
        store.put(drop_id, &TaskRecord::pending(drop_id, now)).await.unwrap();

        store.delete(drop_id).await.unwrap();
        store.delete(drop_id).await.unwrap();

        let scanned = store.scan_all().await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].0, keep);
    }

    #[tokio::test]
    async fn undecodable_row_is_skipped_not_fatal() {
        let store = test_store().await;
        let good = TaskId::new();
        store.put(good, &TaskRecord::pending(good, Utc::now())).await.unwrap();
        let bad = TaskId::new();
        store.put_raw(&bad.to_string(), "{}").await;
        store.put_raw("not-a-task-id", "{}").await;

        let scanned = store.scan_all().await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].0, good);
        assert_eq!(store.scan_corrupt().await.unwrap(), vec![bad]);
        assert!(matches!(store.get(bad).await, Err(StoreError::Corrupt { .. })));

        store.delete(bad).await.unwrap();
        assert!(store.scan_corrupt().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("tasks.db");
        let store = LibSqlTaskStore::new_local(&db_path).await.unwrap();
        let id = TaskId::new();
        store.put(id, &TaskRecord::pending(id, Utc::now())).await.unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("tasks.db");
        let id = TaskId::new();
        let record = TaskRecord::pending(id, Utc::now());
        {
            let store = LibSqlTaskStore::new_local(&db_path).await.unwrap();
            store.put(id, &record).await.unwrap();
        }

        let reopened = LibSqlTaskStore::new_local(&db_path).await.unwrap();
        assert_eq!(reopened.get(id).await.unwrap(), Some(record));
    }
}
