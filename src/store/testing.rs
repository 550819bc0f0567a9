//! Store doubles shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::{MemoryTaskStore, TaskStore};
use crate::tasks::model::{TaskId, TaskRecord};

/// In-memory store whose writes start failing after `healthy_puts` calls,
/// for the next `failing_puts` calls, then recover.
pub(crate) struct FlakyStore {
    inner: MemoryTaskStore,
    healthy_puts: AtomicUsize,
    failing_puts: AtomicUsize,
}

impl FlakyStore {
    /// Every write after the first `healthy_puts` fails.
    pub(crate) fn failing_after(healthy_puts: usize) -> Self {
        Self::with_outage(healthy_puts, usize::MAX)
    }

    /// `failing_puts` writes fail once `healthy_puts` have succeeded.
    pub(crate) fn with_outage(healthy_puts: usize, failing_puts: usize) -> Self {
        Self {
            inner: MemoryTaskStore::new(),
            healthy_puts: AtomicUsize::new(healthy_puts),
            failing_puts: AtomicUsize::new(failing_puts),
        }
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn put(&self, id: TaskId, record: &TaskRecord) -> Result<(), StoreError> {
        let healthy = self.healthy_puts.load(Ordering::SeqCst);
        if healthy > 0 {
            self.healthy_puts.store(healthy - 1, Ordering::SeqCst);
        } else {
            let failing = self.failing_puts.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_puts.store(failing - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".into()));
            }
        }
        self.inner.put(id, record).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn scan_all(&self) -> Result<Vec<(TaskId, TaskRecord)>, StoreError> {
        self.inner.scan_all().await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
