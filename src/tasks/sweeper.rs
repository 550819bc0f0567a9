//! Retention sweeper: periodically deletes task records that have been idle
//! longer than the retention window, whatever their status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::error::TaskError;
use crate::tasks::manager::TaskManager;

/// Deletes stale task records on a fixed interval.
pub struct RetentionSweeper {
    manager: Arc<TaskManager>,
    retention: chrono::Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(manager: Arc<TaskManager>, config: &RetentionConfig) -> Self {
        Self {
            manager,
            retention: chrono::Duration::from_std(config.retention)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            interval: config.sweep_interval,
        }
    }

    /// Sweep against the current clock. Returns the number of records deleted.
    pub async fn sweep(&self) -> Result<usize, TaskError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep treating `now` as the current time.
    ///
    /// A record is deleted when `updated_at < now - retention`. Each
    /// candidate is re-read right before deletion so a task that transitioned
    /// after the snapshot was taken is kept.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, TaskError> {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return Ok(0);
        };
        let candidates: Vec<_> = self
            .manager
            .snapshot()
            .await?
            .into_iter()
            .filter(|record| record.updated_at < cutoff)
            .collect();

        let mut deleted = 0;
        for candidate in candidates {
            match self.manager.get(candidate.id).await {
                Ok(fresh) if fresh.updated_at >= cutoff => {
                    debug!(task_id = %candidate.id, "Task refreshed since snapshot, keeping");
                    continue;
                }
                Ok(_) => {}
                Err(TaskError::NotFound { .. }) => continue,
                Err(e) => {
                    warn!(task_id = %candidate.id, error = %e, "Failed to re-read task during sweep");
                    continue;
                }
            }

            match self.manager.remove(candidate.id).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(
                        task_id = %candidate.id,
                        status = %candidate.status,
                        idle_secs = candidate.idle_for(now).num_seconds(),
                        "Expired task deleted"
                    );
                }
                Err(e) => warn!(task_id = %candidate.id, error = %e, "Failed to delete expired task"),
            }
        }

        deleted += self.purge_corrupt().await;

        if deleted > 0 {
            info!(count = deleted, "Retention sweep removed expired tasks");
        }
        Ok(deleted)
    }

    /// Delete records that no longer decode. They carry no usable timestamp.
    async fn purge_corrupt(&self) -> usize {
        let ids = match self.manager.corrupt_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to list corrupt tasks");
                return 0;
            }
        };

        let mut purged = 0;
        for id in ids {
            match self.manager.remove(id).await {
                Ok(()) => {
                    purged += 1;
                    warn!(task_id = %id, "Corrupt task record deleted");
                }
                Err(e) => warn!(task_id = %id, error = %e, "Failed to delete corrupt task"),
            }
        }
        purged
    }

    /// Start the recurring sweep. The first run happens one interval after start.
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                retention_secs = self.retention.num_seconds(),
                "Retention sweeper started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "Retention sweep failed");
                        }
                    }
                }
            }
            info!("Retention sweeper stopped");
        });

        SweeperHandle { shutdown, handle }
    }
}

/// Running sweeper; stop it at process shutdown.
pub struct SweeperHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the loop to exit and wait for it.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Retention sweeper task ended abnormally");
        }
    }
}
