/// Common error types for the Taskmill core
///
/// Every failure in the engine carries a typed kind; nothing escapes as a
/// bare string. Each kind maps one-to-one onto a transport error code via
/// [`TaskmillError::code`], so the server layer never has to guess at a
/// classification.
///
/// # Propagation policy
///
/// | Kind              | Recovered locally?                          |
/// |-------------------|---------------------------------------------|
/// | `MalformedInput`  | No                                          |
/// | `InvalidGraph`    | No                                          |
/// | `AcquireTimeout`  | Retried once at the repository layer        |
/// | `SpawnFailed`     | Retried by the supervisor up to max retries |
/// | `ChildTimeout`    | No; task terminal state = `timeout`         |
/// | `Cancelled`       | No; task terminal state = `cancelled`       |
/// | `MigrationFailed` | No; server fails to start                   |

use thiserror::Error;

/// Result alias used across the shared and engine crates.
pub type TaskmillResult<T> = Result<T, TaskmillError>;

/// Unified error type for the Taskmill core.
#[derive(Debug, Error)]
pub enum TaskmillError {
    /// The task markdown is missing a required section or is otherwise
    /// unparseable.
    #[error("malformed task markdown: {0}")]
    MalformedInput(String),

    /// A named dependency does not resolve to exactly one sibling.
    #[error("ambiguous dependency: {0}")]
    AmbiguousDependency(String),

    /// The parsed dependency graph is not a DAG or names an unknown node.
    #[error("invalid task graph: {0}")]
    InvalidGraph(String),

    /// The store pool could not hand out a connection within the
    /// configured acquire window. Retryable.
    #[error("timed out acquiring a store connection")]
    AcquireTimeout,

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The referenced task graph is already being driven by a scheduler.
    #[error("task {0} is already running")]
    AlreadyRunning(String),

    /// The assistant CLI could not be spawned, even after retries.
    #[error("failed to spawn assistant process after {attempts} attempts: {message}")]
    SpawnFailed { attempts: u32, message: String },

    /// The child process exceeded its deadline.
    #[error("child process exceeded {timeout_ms}ms timeout")]
    ChildTimeout { timeout_ms: i64 },

    /// The task was cancelled before reaching a natural terminal state.
    #[error("task was cancelled")]
    Cancelled,

    /// A tool request failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The transport named a tool this server does not expose.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// A schema migration failed; the store is unusable.
    #[error("schema migration failed: {0}")]
    MigrationFailed(String),

    /// Underlying store error.
    #[error("store error: {0}")]
    Database(sqlx::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskmillError {
    /// Maps this error onto its transport error code.
    pub fn code(&self) -> &'static str {
        match self {
            TaskmillError::MalformedInput(_) => "invalid-input",
            TaskmillError::AmbiguousDependency(_) => "invalid-input",
            TaskmillError::InvalidInput(_) => "invalid-input",
            TaskmillError::InvalidGraph(_) => "invalid-graph",
            TaskmillError::AcquireTimeout => "acquire-timeout",
            TaskmillError::NotFound(_) => "not-found",
            TaskmillError::AlreadyRunning(_) => "already-running",
            TaskmillError::SpawnFailed { .. } => "spawn-failed",
            TaskmillError::ChildTimeout { .. } => "child-timeout",
            TaskmillError::Cancelled => "internal",
            TaskmillError::UnknownTool(_) => "unknown-tool",
            TaskmillError::MigrationFailed(_) => "internal",
            TaskmillError::Database(_) => "internal",
            TaskmillError::Internal(_) => "internal",
        }
    }

    /// True for failures the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskmillError::AcquireTimeout)
    }
}

impl From<sqlx::Error> for TaskmillError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            // Pool exhaustion surfaces as the retryable acquire-timeout kind.
            sqlx::Error::PoolTimedOut => TaskmillError::AcquireTimeout,
            other => TaskmillError::Database(other),
        }
    }
}
