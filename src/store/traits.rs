//! Backend-agnostic `TaskStore` trait.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::tasks::model::{TaskId, TaskRecord};

/// Keyed storage for task records.
///
/// Implementations must be safe for concurrent use. Every write replaces the
/// whole record, so readers never observe a partially updated task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace the record stored under `id`.
    async fn put(&self, id: TaskId, record: &TaskRecord) -> Result<(), StoreError>;

    /// Fetch a record. Absent keys yield `Ok(None)`.
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Remove a record. Deleting an absent key is not an error.
    async fn delete(&self, id: TaskId) -> Result<(), StoreError>;

    /// Snapshot of every stored record.
    ///
    /// Records written concurrently may or may not appear; records that
    /// existed for the whole scan always do. Entries that fail to decode are
    /// logged and skipped rather than failing the scan.
    async fn scan_all(&self) -> Result<Vec<(TaskId, TaskRecord)>, StoreError>;

    /// Ids whose stored record no longer decodes.
    async fn scan_corrupt(&self) -> Result<Vec<TaskId>, StoreError> {
        Ok(Vec::new())
    }

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}
