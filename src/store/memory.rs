//! In-process task store. Contents are lost when the process exits.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::store::traits::TaskStore;
use crate::tasks::model::{TaskId, TaskRecord};

/// Volatile `HashMap`-backed store.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn put(&self, id: TaskId, record: &TaskRecord) -> Result<(), StoreError> {
        self.records.write().await.insert(id, record.clone());
        debug!(task_id = %id, status = %record.status, "Task stored");
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        self.records.write().await.remove(&id);
        Ok(())
    }

    async fn scan_all(&self) -> Result<Vec<(TaskId, TaskRecord)>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::tasks::model::TaskStatus;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryTaskStore::new();
        let id = TaskId::new();
        let record = TaskRecord::pending(id, Utc::now());

        store.put(id, &record).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(record));

        store.delete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = MemoryTaskStore::new();
        assert!(store.get(TaskId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let store = MemoryTaskStore::new();
        store.delete(TaskId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn put_replaces_whole_record() {
        let store = MemoryTaskStore::new();
        let id = TaskId::new();
        let now = Utc::now();
        let record = TaskRecord::pending(id, now);
        store.put(id, &record).await.unwrap();

        let failed = record
            .transitioned(TaskStatus::Failed, None, Some("nope".into()), now)
            .unwrap();
        store.put(id, &failed).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn scan_all_returns_every_record() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let ids: Vec<TaskId> = (0..5).map(|_| TaskId::new()).collect();
        for id in &ids {
            store.put(*id, &TaskRecord::pending(*id, now)).await.unwrap();
        }

        let mut scanned: Vec<TaskId> = store
            .scan_all()
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        scanned.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(scanned, expected);
    }
}
