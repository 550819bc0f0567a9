//! Task lifecycle manager: the only component that writes task records.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::TaskError;
use crate::store::TaskStore;
use crate::tasks::model::{TaskId, TaskRecord, TaskStatus, TransitionRejection};

/// Creates tasks, enforces the status state machine, and mediates every
/// read and write against the injected [`TaskStore`].
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Allocate a new `Pending` task and return its id.
    pub async fn create(&self) -> Result<TaskId, TaskError> {
        let id = TaskId::new();
        let record = TaskRecord::pending(id, Utc::now());
        self.store.put(id, &record).await?;

        info!(task_id = %id, "Task created");
        Ok(id)
    }

    /// Snapshot of a task.
    pub async fn get(&self, id: TaskId) -> Result<TaskRecord, TaskError> {
        self.store
            .get(id)
            .await?
            .ok_or(TaskError::NotFound { id })
    }

    /// Move a task to `to`, recording `result` (for `Completed`) or `error`
    /// (for `Failed`).
    ///
    /// The new record is written with a single `put`; on any error the
    /// stored record is unchanged.
    pub async fn transition(
        &self,
        id: TaskId,
        to: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<TaskRecord, TaskError> {
        let current = self.get(id).await?;

        let next = current
            .transitioned(to, result, error, Utc::now())
            .map_err(|rejection| match rejection {
                TransitionRejection::Unreachable => TaskError::InvalidTransition {
                    id,
                    from: current.status,
                    to,
                },
                TransitionRejection::MissingOutcome(field) => TaskError::MissingOutcome {
                    id,
                    status: to,
                    field,
                },
            })?;

        self.store.put(id, &next).await?;

        info!(task_id = %id, from = %current.status, to = %to, "Task transitioned");
        Ok(next)
    }

    /// `Pending -> Processing`.
    pub async fn start(&self, id: TaskId) -> Result<TaskRecord, TaskError> {
        self.transition(id, TaskStatus::Processing, None, None).await
    }

    /// `Processing -> Completed` with the artifact reference.
    pub async fn complete(&self, id: TaskId, result: impl Into<String>) -> Result<TaskRecord, TaskError> {
        self.transition(id, TaskStatus::Completed, Some(result.into()), None)
            .await
    }

    /// `Pending | Processing -> Failed` with a message.
    pub async fn fail(&self, id: TaskId, error: impl Into<String>) -> Result<TaskRecord, TaskError> {
        self.transition(id, TaskStatus::Failed, None, Some(error.into()))
            .await
    }

    /// Every stored record, for retention scans.
    pub async fn snapshot(&self) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(self
            .store
            .scan_all()
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Ids of stored records that no longer decode.
    pub async fn corrupt_ids(&self) -> Result<Vec<TaskId>, TaskError> {
        Ok(self.store.scan_corrupt().await?)
    }

    /// Drop a record. Used only by retention.
    pub(crate) async fn remove(&self, id: TaskId) -> Result<(), TaskError> {
        self.store.delete(id).await?;
        debug!(task_id = %id, "Task removed");
        Ok(())
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }
}
