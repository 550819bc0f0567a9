//! Bounded background executor.
//!
//! Submissions go onto an unbounded FIFO queue. A single dispatcher pulls
//! them in order and hands each to the pool once a slot (semaphore permit)
//! frees up. Each slot owns its task for the rest of the lifecycle:
//! Pending → Processing → Completed/Failed.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{ConversionError, ExecutorError, TaskError};
use crate::tasks::{TaskId, TaskManager, TaskRecord};
use crate::worker::job::{Workload, WorkloadRunner};

/// Error recorded on tasks that never started because the executor stopped.
pub const SHUTDOWN_MESSAGE: &str = "Executor shut down before the task started";

/// Attempts made to persist a lifecycle transition before giving up.
const STORE_ATTEMPTS: u32 = 3;
const STORE_BACKOFF: Duration = Duration::from_millis(200);

struct QueuedJob {
    id: TaskId,
    workload: Workload,
    cancel: CancellationToken,
}

/// State shared between the handle, the dispatcher, and every slot.
struct Shared {
    manager: Arc<TaskManager>,
    runner: Arc<dyn WorkloadRunner>,
    default_deadline: Option<Duration>,
    /// Cancellation tokens for queued and running tasks.
    tokens: RwLock<HashMap<TaskId, CancellationToken>>,
}

/// Runs conversions off the request path with at most `concurrency` at once.
pub struct BackgroundExecutor {
    shared: Arc<Shared>,
    queue_tx: mpsc::UnboundedSender<QueuedJob>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundExecutor {
    /// Start the dispatcher. Must be called from within a tokio runtime.
    pub fn start(manager: Arc<TaskManager>, runner: Arc<dyn WorkloadRunner>, config: &ExecutorConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        let shared = Arc::new(Shared {
            manager,
            runner,
            default_deadline: config.default_deadline,
            tokens: RwLock::new(HashMap::new()),
        });
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::clone(&shared),
            queue_rx,
            Arc::new(Semaphore::new(concurrency)),
            shutdown.clone(),
        ));
        info!(concurrency, "Background executor started");

        Self {
            shared,
            queue_tx,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Queue a conversion for a `Pending` task. Returns as soon as it is queued.
    ///
    /// If the executor is shutting down the task is marked `Failed` and
    /// [`ExecutorError::ShuttingDown`] is returned.
    pub async fn submit(&self, id: TaskId, workload: Workload) -> Result<(), ExecutorError> {
        if self.shutdown.is_cancelled() {
            self.reject(id).await?;
            return Err(ExecutorError::ShuttingDown);
        }

        let cancel = CancellationToken::new();
        self.shared.tokens.write().await.insert(id, cancel.clone());

        if self.queue_tx.send(QueuedJob { id, workload, cancel }).is_err() {
            self.shared.tokens.write().await.remove(&id);
            self.reject(id).await?;
            return Err(ExecutorError::ShuttingDown);
        }

        debug!(task_id = %id, "Task queued");
        Ok(())
    }

    async fn reject(&self, id: TaskId) -> Result<(), ExecutorError> {
        warn!(task_id = %id, "Submission refused, executor is shutting down");
        self.shared.manager.fail(id, SHUTDOWN_MESSAGE).await?;
        Ok(())
    }

    /// Signal cancellation for a queued or running task.
    ///
    /// Returns `false` when the executor doesn't know the task (already
    /// finished, or never submitted).
    pub async fn cancel(&self, id: TaskId) -> bool {
        match self.shared.tokens.read().await.get(&id) {
            Some(token) => {
                token.cancel();
                info!(task_id = %id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Number of tasks queued or running.
    pub async fn tracked(&self) -> usize {
        self.shared.tokens.read().await.len()
    }

    /// Stop accepting work, fail everything still queued, and wait for
    /// in-flight conversions to finish. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Executor dispatcher ended abnormally");
            }
            info!("Background executor stopped");
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut queue_rx: mpsc::UnboundedReceiver<QueuedJob>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let mut in_flight = JoinSet::new();
    let mut held: Option<QueuedJob> = None;

    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = queue_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                held = Some(job);
                break;
            }
            permit = Arc::clone(&slots).acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            held = Some(job);
            break;
        };

        // Reap finished slots
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(run_job(Arc::clone(&shared), job, permit));
    }

    queue_rx.close();
    let mut abandoned = 0usize;
    let leftovers = held.into_iter().chain(std::iter::from_fn(|| queue_rx.try_recv().ok()));
    for job in leftovers.collect::<Vec<_>>() {
        shared.tokens.write().await.remove(&job.id);
        let outcome = with_store_retry(job.id, || shared.manager.fail(job.id, SHUTDOWN_MESSAGE)).await;
        if let Err(e) = outcome {
            error!(task_id = %job.id, error = %e, "Failed to record shutdown for queued task");
        }
        abandoned += 1;
    }
    if abandoned > 0 {
        info!(count = abandoned, "Failed queued tasks at shutdown");
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Executor slot ended abnormally");
        }
    }
}

/// Drive one task from `Pending` to a terminal status. The permit is held
/// until the outcome is persisted.
async fn run_job(shared: Arc<Shared>, job: QueuedJob, permit: OwnedSemaphorePermit) {
    let QueuedJob { id, workload, cancel } = job;

    let outcome = if cancel.is_cancelled() {
        Some(Err(ConversionError::Cancelled))
    } else {
        match with_store_retry(id, || shared.manager.start(id)).await {
            Ok(_) => {
                info!(task_id = %id, "Task processing");
                let deadline = workload.deadline.or(shared.default_deadline);
                Some(execute(Arc::clone(&shared.runner), workload, cancel, deadline).await)
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "Could not start task");
                None
            }
        }
    };

    // Not cancellable once the outcome is known.
    shared.tokens.write().await.remove(&id);
    if let Some(outcome) = outcome {
        record_outcome(&shared, id, outcome).await;
    }
    drop(permit);
}

/// Run the workload on its own tokio task so panics and deadlines can be
/// turned into conversion failures.
async fn execute(
    runner: Arc<dyn WorkloadRunner>,
    workload: Workload,
    cancel: CancellationToken,
    deadline: Option<Duration>,
) -> Result<String, ConversionError> {
    let token = cancel.clone();
    let mut handle = tokio::spawn(async move { runner.run(&workload, &token).await });

    let joined = match deadline {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // Dropping the runner's future kills any child process.
                cancel.cancel();
                handle.abort();
                return Err(ConversionError::Timeout(limit));
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(ConversionError::Panicked(panic_message(e.into_panic()))),
        Err(_) => Err(ConversionError::Cancelled),
    }
}

async fn record_outcome(shared: &Shared, id: TaskId, outcome: Result<String, ConversionError>) {
    let persisted = match &outcome {
        Ok(result) => with_store_retry(id, || shared.manager.complete(id, result.as_str())).await,
        Err(e) => {
            warn!(task_id = %id, error = %e, "Conversion failed");
            let message = e.to_string();
            with_store_retry(id, || shared.manager.fail(id, message.as_str())).await
        }
    };

    match persisted {
        Ok(record) => info!(task_id = %id, status = %record.status, "Task finished"),
        Err(e) => error!(task_id = %id, error = %e, "Could not record task outcome"),
    }
}

/// Retry a lifecycle write while the store reports infrastructure failures.
async fn with_store_retry<F, Fut>(id: TaskId, mut op: F) -> Result<TaskRecord, TaskError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TaskRecord, TaskError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_store_failure() && attempt < STORE_ATTEMPTS => {
                warn!(task_id = %id, attempt, error = %e, "Store write failed, retrying");
                tokio::time::sleep(STORE_BACKOFF * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::store::testing::FlakyStore;
    use crate::store::{MemoryTaskStore, TaskStore};
    use crate::tasks::TaskStatus;

    /// Test runner whose behavior is chosen by the workload's source string.
    #[derive(Default)]
    struct ScriptedRunner {
        active: AtomicUsize,
        peak: AtomicUsize,
        started: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkloadRunner for ScriptedRunner {
        async fn run(&self, workload: &Workload, cancel: &CancellationToken) -> Result<String, ConversionError> {
            self.started.lock().unwrap().push(workload.source.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let outcome = match workload.source.as_str() {
                "panic" => panic!("converter exploded"),
                "fail" => Err(ConversionError::ToolFailed {
                    code: 1,
                    stderr: "broken pdf".to_string(),
                }),
                "hang" => {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(ConversionError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_secs(30)) => Ok("late".to_string()),
                    }
                }
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok("/uploads/converts/slow.html".to_string())
                }
                other => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(format!("/uploads/converts/{other}.html"))
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn setup(concurrency: usize, deadline: Option<Duration>) -> (Arc<TaskManager>, Arc<ScriptedRunner>, BackgroundExecutor) {
        setup_with_store(Arc::new(MemoryTaskStore::new()), concurrency, deadline)
    }

    fn setup_with_store(
        store: Arc<dyn TaskStore>,
        concurrency: usize,
        deadline: Option<Duration>,
    ) -> (Arc<TaskManager>, Arc<ScriptedRunner>, BackgroundExecutor) {
        let manager = Arc::new(TaskManager::new(store));
        let runner = Arc::new(ScriptedRunner::default());
        let executor = BackgroundExecutor::start(
            Arc::clone(&manager),
            runner.clone(),
            &ExecutorConfig {
                concurrency,
                default_deadline: deadline,
            },
        );
        (manager, runner, executor)
    }

    async fn submit(manager: &TaskManager, executor: &BackgroundExecutor, source: &str) -> TaskId {
        let id = manager.create().await.unwrap();
        executor.submit(id, Workload::new(source, "/tmp/converts")).await.unwrap();
        id
    }

    async fn wait_terminal(manager: &TaskManager, id: TaskId) -> TaskRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = manager.get(id).await.unwrap();
                if record.status.is_terminal() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task did not reach a terminal status")
    }

    #[tokio::test]
    async fn success_completes_with_result() {
        let (manager, _runner, executor) = setup(2, None);
        let id = submit(&manager, &executor, "report").await;

        let record = wait_terminal(&manager, id).await;
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("/uploads/converts/report.html"));
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn failure_is_recorded_not_raised() {
        let (manager, _runner, executor) = setup(2, None);
        let id = submit(&manager, &executor, "fail").await;

        let record = wait_terminal(&manager, id).await;
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("broken pdf"));
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn panic_becomes_failed() {
        let (manager, _runner, executor) = setup(1, None);
        let id = submit(&manager, &executor, "panic").await;

        let record = wait_terminal(&manager, id).await;
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("converter exploded"));

        // The slot is released after a panic.
        let next = submit(&manager, &executor, "after").await;
        assert_eq!(wait_terminal(&manager, next).await.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn never_exceeds_pool_size() {
        let (manager, runner, executor) = setup(2, None);
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(submit(&manager, &executor, &format!("doc{i}")).await);
        }
        for id in ids {
            assert_eq!(wait_terminal(&manager, id).await.status, TaskStatus::Completed);
        }
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(runner.started.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn stored_processing_count_stays_within_pool() {
        let (manager, _runner, executor) = setup(2, None);

        let stop = CancellationToken::new();
        let watcher = tokio::spawn({
            let manager = Arc::clone(&manager);
            let stop = stop.clone();
            async move {
                let mut peak = 0;
                while !stop.is_cancelled() {
                    let processing = manager
                        .snapshot()
                        .await
                        .unwrap()
                        .iter()
                        .filter(|record| record.status == TaskStatus::Processing)
                        .count();
                    peak = peak.max(processing);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                peak
            }
        });

        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(submit(&manager, &executor, &format!("doc{i}")).await);
        }
        for id in ids {
            assert_eq!(wait_terminal(&manager, id).await.status, TaskStatus::Completed);
        }
        stop.cancel();

        let peak = watcher.await.unwrap();
        assert!(peak >= 1, "never observed a running task");
        assert!(peak <= 2, "{peak} tasks were Processing at once");
    }

    #[tokio::test]
    async fn transient_store_outage_on_completion_is_retried() {
        // create and start succeed, the first completion write fails
        let (manager, _runner, executor) = setup_with_store(Arc::new(FlakyStore::with_outage(2, 1)), 1, None);
        let id = submit(&manager, &executor, "report").await;

        let record = wait_terminal(&manager, id).await;
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("/uploads/converts/report.html"));
    }

    #[tokio::test]
    async fn persistent_store_outage_leaves_task_processing() {
        let (manager, _runner, executor) = setup_with_store(Arc::new(FlakyStore::with_outage(2, 3)), 1, None);
        let id = submit(&manager, &executor, "report").await;

        // three attempts with 200ms and 400ms backoff between them
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(executor.tracked().await, 0);
        assert_eq!(manager.get(id).await.unwrap().status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn single_slot_runs_in_submission_order() {
        let (manager, runner, executor) = setup(1, None);
        let mut ids = Vec::new();
        for name in ["a", "b", "c", "d"] {
            ids.push(submit(&manager, &executor, name).await);
        }
        for id in ids {
            wait_terminal(&manager, id).await;
        }
        assert_eq!(*runner.started.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn deadline_fails_with_timeout() {
        let (manager, _runner, executor) = setup(1, Some(Duration::from_millis(100)));
        let id = submit(&manager, &executor, "hang").await;

        let record = wait_terminal(&manager, id).await;
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn workload_deadline_overrides_default() {
        let (manager, _runner, executor) = setup(1, Some(Duration::from_secs(60)));
        let id = manager.create().await.unwrap();
        executor
            .submit(
                id,
                Workload::new("hang", "/tmp/converts").with_deadline(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        let record = wait_terminal(&manager, id).await;
        assert!(record.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancel_running_task() {
        let (manager, _runner, executor) = setup(1, None);
        let id = submit(&manager, &executor, "hang").await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.get(id).await.unwrap().status != TaskStatus::Processing {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(executor.cancel(id).await);

        let record = wait_terminal(&manager, id).await;
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("Conversion cancelled"));
        assert!(!executor.cancel(id).await);
    }

    #[tokio::test]
    async fn cancel_queued_task_skips_run() {
        let (manager, runner, executor) = setup(1, None);
        let blocker = submit(&manager, &executor, "hang").await;
        let queued = submit(&manager, &executor, "queued").await;

        assert!(executor.cancel(queued).await);
        executor.cancel(blocker).await;

        let record = wait_terminal(&manager, queued).await;
        assert_eq!(record.status, TaskStatus::Failed);
        wait_terminal(&manager, blocker).await;
        assert!(!runner.started.lock().unwrap().contains(&"queued".to_string()));
    }

    #[tokio::test]
    async fn shutdown_finishes_in_flight_and_fails_queued() {
        let (manager, _runner, executor) = setup(1, None);
        let running = submit(&manager, &executor, "slow").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.get(running).await.unwrap().status != TaskStatus::Processing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let queued = vec![
            submit(&manager, &executor, "second").await,
            submit(&manager, &executor, "third").await,
        ];

        executor.shutdown().await;

        assert_eq!(manager.get(running).await.unwrap().status, TaskStatus::Completed);
        for id in queued {
            let record = manager.get(id).await.unwrap();
            assert_eq!(record.status, TaskStatus::Failed);
            assert_eq!(record.error.as_deref(), Some(SHUTDOWN_MESSAGE));
        }
        assert_eq!(executor.tracked().await, 0);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let (manager, _runner, executor) = setup(1, None);
        executor.shutdown().await;
        executor.shutdown().await;

        let id = manager.create().await.unwrap();
        let err = executor
            .submit(id, Workload::new("late", "/tmp/converts"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ShuttingDown));
        assert_eq!(manager.get(id).await.unwrap().status, TaskStatus::Failed);
    }
}
