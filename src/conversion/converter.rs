//! External converter invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ConverterConfig;
use crate::error::ConversionError;

/// Maximum stderr kept in a failure message.
const MAX_STDERR: usize = 2 * 1024;

/// Turns a source document into a viewable artifact.
///
/// Calls may take minutes and can fail for any reason; at most one artifact
/// is produced per call.
#[async_trait]
pub trait ConversionInvoker: Send + Sync {
    /// Convert `source`, writing the artifact into `work_dir`, and return its path.
    async fn invoke(&self, source: &Path, work_dir: &Path) -> Result<PathBuf, ConversionError>;
}

/// Runs a pdf2htmlEX-compatible binary as a child process:
/// `<program> [prefix args...] --zoom <zoom> --dest-dir <work_dir> <source>`.
///
/// Prefix args allow wrapping the tool, e.g. `docker run --rm -v ... image`.
///
/// The child is killed if the returned future is dropped, which is how
/// timeouts and cancellation stop it.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    prefix_args: Vec<String>,
    zoom: f32,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>, zoom: f32) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            zoom,
        }
    }

    pub fn with_prefix_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    pub fn from_config(config: &ConverterConfig) -> Self {
        Self::new(config.program.clone(), config.zoom).with_prefix_args(config.prefix_args.clone())
    }

    /// Artifact path the converter produces for `source`.
    pub fn output_path(source: &Path, work_dir: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        work_dir.join(format!("{stem}.html"))
    }
}

#[async_trait]
impl ConversionInvoker for CommandConverter {
    async fn invoke(&self, source: &Path, work_dir: &Path) -> Result<PathBuf, ConversionError> {
        tokio::fs::create_dir_all(work_dir).await?;

        debug!(program = %self.program, source = %source.display(), "Starting converter");
        let output = Command::new(&self.program)
            .args(&self.prefix_args)
            .arg("--zoom")
            .arg(self.zoom.to_string())
            .arg("--dest-dir")
            .arg(work_dir)
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConversionError::Spawn(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(ConversionError::ToolFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: truncate(String::from_utf8_lossy(&output.stderr).trim(), MAX_STDERR),
            });
        }

        let artifact = Self::output_path(source, work_dir);
        if !tokio::fs::try_exists(&artifact).await? {
            return Err(ConversionError::ToolFailed {
                code: 0,
                stderr: format!("converter produced no output at {}", artifact.display()),
            });
        }

        info!(artifact = %artifact.display(), "Conversion finished");
        Ok(artifact)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
