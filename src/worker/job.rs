//! Work units and the runner seam.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ConversionError;

/// Everything needed to run one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    /// Document reference as submitted (URL or `/uploads/...` path).
    pub source: String,
    /// Directory the artifact is written into.
    pub work_dir: PathBuf,
    /// Overrides the executor's default deadline when set.
    pub deadline: Option<Duration>,
}

impl Workload {
    pub fn new(source: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            work_dir: work_dir.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Executes a workload and returns the output reference stored as the
/// task's `result`.
///
/// Implementations should check `cancel` between steps and return
/// [`ConversionError::Cancelled`] once it fires.
#[async_trait]
pub trait WorkloadRunner: Send + Sync {
    async fn run(&self, workload: &Workload, cancel: &CancellationToken) -> Result<String, ConversionError>;
}
