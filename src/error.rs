//! Error types for the conversion task service.

use std::time::Duration;

use crate::tasks::model::{TaskId, TaskStatus};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task store backend errors.
///
/// `Unavailable` is an infrastructure failure: callers may retry, and it is
/// never recorded as a task failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: TaskId },

    #[error("Task {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} cannot enter {status} without a {field}")]
    MissingOutcome {
        id: TaskId,
        status: TaskStatus,
        field: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    /// Whether the failure came from the backing store rather than the task itself.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Background executor errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Executor is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Failures produced while fetching or converting a document.
///
/// These are recorded as the task's terminal `error` and never propagate out
/// of the executor.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Download failed: {0}")]
    Fetch(String),

    #[error("Source file does not exist: {0}")]
    SourceMissing(String),

    #[error("Invalid source reference: {0}")]
    InvalidSource(String),

    #[error("Failed to start converter: {0}")]
    Spawn(String),

    #[error("Converter exited with code {code}: {stderr}")]
    ToolFailed { code: i32, stderr: String },

    #[error("Conversion timed out after {0:?}")]
    Timeout(Duration),

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Conversion panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
