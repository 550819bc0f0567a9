//! Task record and its status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque task identifier (random 128-bit UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a conversion task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for a worker slot.
    Pending,
    /// A worker is running the conversion.
    Processing,
    /// Conversion produced an artifact.
    Completed,
    /// Conversion failed or was rejected before it started.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `Pending -> Failed` covers tasks rejected before dispatch.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Why a status change was refused by [`TaskRecord::transitioned`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    /// Target is not reachable from the current status.
    Unreachable,
    /// Terminal status requested without its result or error.
    MissingOutcome(&'static str),
}

/// A persisted conversion task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Output reference, present only when `Completed`.
    pub result: Option<String>,
    /// Failure message, present only when `Failed`.
    pub error: Option<String>,
}

impl TaskRecord {
    /// A fresh pending record stamped at `now`.
    pub fn pending(id: TaskId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        }
    }

    /// Build the record that results from moving to `to` at `now`.
    ///
    /// The receiver is left untouched so a failed write never exposes a
    /// half-applied record. `result` is kept only for `Completed` and
    /// `error` only for `Failed`; the other is cleared.
    pub fn transitioned(
        &self,
        to: TaskStatus,
        result: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, TransitionRejection> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionRejection::Unreachable);
        }

        let (result, error) = match to {
            TaskStatus::Completed => (
                Some(result.ok_or(TransitionRejection::MissingOutcome("result"))?),
                None,
            ),
            TaskStatus::Failed => (
                None,
                Some(error.ok_or(TransitionRejection::MissingOutcome("error"))?),
            ),
            TaskStatus::Pending | TaskStatus::Processing => (None, None),
        };

        Ok(TaskRecord {
            id: self.id,
            status: to,
            created_at: self.created_at,
            updated_at: now.max(self.created_at),
            result,
            error,
        })
    }

    /// Age of the last transition relative to `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.updated_at)
    }
}
