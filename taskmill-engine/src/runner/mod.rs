/// Task runner trait and types
///
/// This module defines the contract at the child-process seam. A runner
/// takes one prompt, executes it in a working directory, and reports the
/// captured output plus the exit condition. The supervisor owns every
/// policy decision (timeouts, heartbeats, retries, the result taxonomy),
/// so runners stay small: run the work, honor the kill token, return what
/// happened.
///
/// # Kill contract
///
/// When the kill token fires, the runner must terminate the work promptly
/// (for processes: SIGTERM, a short grace, then SIGKILL) and still return
/// a [`ChildOutput`] with whatever was captured. The supervisor decides
/// whether that termination was a timeout or a cancel.
///
/// # Errors
///
/// [`RunnerError::SpawnFailed`] means the child never started and the
/// attempt is retriable. Any failure after the child started is reported
/// through the exit code, never as a spawn error.

pub mod cli;
pub mod mock;

pub use cli::CliRunner;
pub use mock::MockRunner;

use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Cap on captured stdout (head is kept).
pub const STDOUT_CAP_BYTES: usize = 1024 * 1024;

/// Cap on captured stderr (tail is kept: the end of a crash log is the
/// useful part).
pub const STDERR_CAP_BYTES: usize = 64 * 1024;

/// Runner error types
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The child process never started. Retriable.
    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    /// I/O failure after the child started. Not retriable.
    #[error("child I/O error: {0}")]
    Io(String),
}

/// Runner result type alias
pub type RunnerResult<T> = Result<T, RunnerError>;

/// One execution request.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Task this run belongs to (for logging)
    pub task_id: String,

    /// Prompt piped to the child's stdin
    pub prompt: String,

    /// Working directory for the child
    pub work_directory: PathBuf,
}

/// What the child did.
#[derive(Debug, Clone)]
pub struct ChildOutput {
    /// Exit code; `None` when the child was killed by a signal
    pub exit_code: Option<i32>,

    /// Captured stdout (head, capped at [`STDOUT_CAP_BYTES`])
    pub stdout: String,

    /// Captured stderr (tail, capped at [`STDERR_CAP_BYTES`])
    pub stderr: String,
}

impl ChildOutput {
    /// True when the child exited zero.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Core runner trait
///
/// Implementations: [`CliRunner`] spawns the assistant CLI;
/// [`MockRunner`] produces deterministic outcomes for tests.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Runner name for logs.
    fn name(&self) -> &str;

    /// Executes one prompt to completion or forced termination.
    async fn run(&self, request: RunRequest, kill: CancellationToken) -> RunnerResult<ChildOutput>;
}
