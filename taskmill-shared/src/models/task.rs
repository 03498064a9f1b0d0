/// Task model and database operations
///
/// A task is a node in the execution graph: the root of a graph has no
/// parent, sub-tasks carry their root's id as `parent_id`. Tasks are the
/// core entity of the Taskmill system; logs, results, telemetry and
/// instance bindings all hang off a task row.
///
/// # State Machine
///
/// ```text
/// pending → running → completed
///                   → failed
///                   → timeout
/// pending → cancelled
/// running → cancelled
/// ```
///
/// Terminal transitions are guarded in SQL (`WHERE status = ...`), so a
/// late writer loses the race and observes `None` instead of clobbering a
/// terminal state. Timeout handling additionally claims the
/// `timeout_handled` flag through a single-writer update.
///
/// # Example
///
/// ```no_run
/// use taskmill_shared::models::task::{CreateTask, Task};
/// use sqlx::SqlitePool;
///
/// # async fn example(pool: SqlitePool) -> Result<(), sqlx::Error> {
/// let task = Task::create(
///     &pool,
///     CreateTask {
///         name: "Summarize repository".into(),
///         prompt: "Read the repository and summarize it".into(),
///         work_directory: "/work/repo".into(),
///         timeout_ms: 300_000,
///         ..Default::default()
///     },
/// )
/// .await?;
///
/// Task::mark_running(&pool, &task.id).await?;
/// # Ok(())
/// # }
/// ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task is queued, waiting to be dispatched
    Pending,

    /// Task is currently executing
    Running,

    /// Task completed successfully
    Completed,

    /// Task failed with an error
    Failed,

    /// Task was cancelled by the user or a dependency failure
    Cancelled,

    /// Task exceeded its deadline
    Timeout,
}

impl TaskStatus {
    /// Converts status to its stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    /// Parses the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "timeout" => Some(TaskStatus::Timeout),
            _ => None,
        }
    }

    /// Checks if the status is terminal (no outgoing transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Checks if transition to `target` is valid.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        match (self, target) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled) => true,
            (TaskStatus::Running, TaskStatus::Completed) => true,
            (TaskStatus::Running, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Timeout) => true,
            (TaskStatus::Running, TaskStatus::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory task priority. Does not re-order dispatch within a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// How a node's children within the same declaration group are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One at a time, in declaration order
    Sequential,

    /// Concurrently, up to the supervisor cap
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sequential" => Some(ExecutionMode::Sequential),
            "parallel" => Some(ExecutionMode::Parallel),
            _ => None,
        }
    }
}

/// How much of the output the caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnMode {
    /// Bounded, synthesized summary
    Summary,

    /// Full concatenated output
    Full,
}

impl ReturnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnMode::Summary => "summary",
            ReturnMode::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "summary" => Some(ReturnMode::Summary),
            "full" => Some(ReturnMode::Full),
            _ => None,
        }
    }
}

/// Task model representing a node in the execution graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable task id (markdown-derived for parsed graphs, UUID otherwise)
    pub id: String,

    /// Graph edge to the root task (None for roots)
    pub parent_id: Option<String>,

    /// Current execution status
    pub status: TaskStatus,

    /// Progress 0–100. Frozen at the last observed value on non-success
    /// terminal states; forced to 100 on completion.
    pub progress: i64,

    /// Advisory priority
    pub priority: Priority,

    /// Dispatch mode for this node's children
    pub execution_mode: ExecutionMode,

    /// Human-readable name
    pub name: String,

    /// Human-readable description (the objective for parsed roots)
    pub description: String,

    /// Prompt text submitted to the assistant CLI
    pub prompt: String,

    /// Working directory for the child process
    pub work_directory: String,

    /// Output shaping requested by the caller
    pub return_mode: Option<ReturnMode>,

    /// Free-form metadata (requirements, parser annotations, …)
    pub metadata: JsonValue,

    /// Instance currently bound to this task (at most one)
    pub instance_id: Option<String>,

    /// Per-task timeout in milliseconds
    pub timeout_ms: i64,

    /// Computed deadline (`created_at + timeout_ms`)
    pub deadline_at: Option<DateTime<Utc>>,

    /// Guard against double-terminal transitions on timeout
    pub timeout_handled: bool,

    /// When the task row was created
    pub created_at: DateTime<Utc>,

    /// When the task started executing
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// When the task was last updated
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Wall-clock duration of a finished task in milliseconds.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// Milliseconds since the task started, for running tasks.
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.started_at
            .map(|start| (Utc::now() - start).num_milliseconds())
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = TaskStatus::parse(&status_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown task status '{}'", status_str).into())
        })?;

        let priority_str: String = row.try_get("priority")?;
        let priority = Priority::parse(&priority_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown priority '{}'", priority_str).into())
        })?;

        let mode_str: String = row.try_get("execution_mode")?;
        let execution_mode = ExecutionMode::parse(&mode_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown execution mode '{}'", mode_str).into())
        })?;

        let return_mode = row
            .try_get::<Option<String>, _>("return_mode")?
            .as_deref()
            .and_then(ReturnMode::parse);

        let metadata_str: String = row.try_get("metadata")?;
        let metadata: JsonValue = serde_json::from_str(&metadata_str)
            .map_err(|e| sqlx::Error::Decode(format!("bad metadata json: {}", e).into()))?;

        Ok(Task {
            id: row.try_get("id")?,
            parent_id: row.try_get("parent_id")?,
            status,
            progress: row.try_get("progress")?,
            priority,
            execution_mode,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            prompt: row.try_get("prompt")?,
            work_directory: row.try_get("work_directory")?,
            return_mode,
            metadata,
            instance_id: row.try_get("instance_id")?,
            timeout_ms: row.try_get("timeout_ms")?,
            deadline_at: row.try_get("deadline_at")?,
            timeout_handled: row.try_get::<i64, _>("timeout_handled")? != 0,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Input for creating a new task
#[derive(Debug, Clone)]
pub struct CreateTask {
    /// Explicit id; a UUID is generated when empty
    pub id: Option<String>,

    /// Root task this node belongs to
    pub parent_id: Option<String>,

    /// Task name
    pub name: String,

    /// Task description
    pub description: String,

    /// Prompt text
    pub prompt: String,

    /// Working directory for the child process
    pub work_directory: String,

    /// Advisory priority
    pub priority: Priority,

    /// Dispatch mode for children
    pub execution_mode: ExecutionMode,

    /// Output shaping
    pub return_mode: Option<ReturnMode>,

    /// Free-form metadata
    pub metadata: JsonValue,

    /// Timeout in milliseconds
    pub timeout_ms: i64,
}

impl Default for CreateTask {
    fn default() -> Self {
        CreateTask {
            id: None,
            parent_id: None,
            name: String::new(),
            description: String::new(),
            prompt: String::new(),
            work_directory: String::new(),
            priority: Priority::Medium,
            execution_mode: ExecutionMode::Sequential,
            return_mode: None,
            metadata: JsonValue::Object(Default::default()),
            timeout_ms: 1_800_000,
        }
    }
}

/// Partial update: only the named fields are written.
#[derive(Debug, Clone, Default)]
pub struct UpdateTask {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub work_directory: Option<String>,
    pub metadata: Option<JsonValue>,
    pub timeout_ms: Option<i64>,
}

impl Task {
    /// Creates a new task in pending state
    ///
    /// Returns the canonical entity including the generated id, deadline
    /// and timestamps.
    pub async fn create(pool: &SqlitePool, data: CreateTask) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        let id = data
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let deadline_at = Some(now + Duration::milliseconds(data.timeout_ms));

        let task = Task {
            id,
            parent_id: data.parent_id,
            status: TaskStatus::Pending,
            progress: 0,
            priority: data.priority,
            execution_mode: data.execution_mode,
            name: data.name,
            description: data.description,
            prompt: data.prompt,
            work_directory: data.work_directory,
            return_mode: data.return_mode,
            metadata: data.metadata,
            instance_id: None,
            timeout_ms: data.timeout_ms,
            deadline_at,
            timeout_handled: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, parent_id, status, progress, priority, execution_mode,
                name, description, prompt, work_directory, return_mode,
                metadata, timeout_ms, deadline_at, timeout_handled,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.parent_id)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(task.priority.as_str())
        .bind(task.execution_mode.as_str())
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.prompt)
        .bind(&task.work_directory)
        .bind(task.return_mode.map(|m| m.as_str()))
        .bind(task.metadata.to_string())
        .bind(task.timeout_ms)
        .bind(task.deadline_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(pool)
        .await?;

        Ok(task)
    }

    /// Finds a task by id.
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .try_map(|row: SqliteRow| Task::from_row(&row))
            .fetch_optional(pool)
            .await
    }

    /// Lists the children of a root task, ordered by creation.
    pub async fn children_of(pool: &SqlitePool, parent_id: &str) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query("SELECT * FROM tasks WHERE parent_id = ? ORDER BY created_at ASC, id ASC")
            .bind(parent_id)
            .try_map(|row: SqliteRow| Task::from_row(&row))
            .fetch_all(pool)
            .await
    }

    /// Lists tasks by status, newest first.
    pub async fn list_by_status(
        pool: &SqlitePool,
        status: TaskStatus,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY created_at DESC LIMIT ?")
            .bind(status.as_str())
            .bind(limit)
            .try_map(|row: SqliteRow| Task::from_row(&row))
            .fetch_all(pool)
            .await
    }

    /// Applies a partial update. Fields not named in `data` are untouched;
    /// last writer wins on the fields it names.
    pub async fn update(
        pool: &SqlitePool,
        id: &str,
        data: UpdateTask,
    ) -> Result<Option<Self>, sqlx::Error> {
        let mut sets: Vec<&str> = vec!["updated_at = ?"];
        if data.name.is_some() {
            sets.push("name = ?");
        }
        if data.description.is_some() {
            sets.push("description = ?");
        }
        if data.priority.is_some() {
            sets.push("priority = ?");
        }
        if data.work_directory.is_some() {
            sets.push("work_directory = ?");
        }
        if data.metadata.is_some() {
            sets.push("metadata = ?");
        }
        if data.timeout_ms.is_some() {
            sets.push("timeout_ms = ?");
        }

        let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql).bind(Utc::now());

        if let Some(name) = &data.name {
            query = query.bind(name);
        }
        if let Some(description) = &data.description {
            query = query.bind(description);
        }
        if let Some(priority) = data.priority {
            query = query.bind(priority.as_str());
        }
        if let Some(work_directory) = &data.work_directory {
            query = query.bind(work_directory);
        }
        if let Some(metadata) = &data.metadata {
            query = query.bind(metadata.to_string());
        }
        if let Some(timeout_ms) = data.timeout_ms {
            query = query.bind(timeout_ms);
        }

        query.bind(id).execute(pool).await?;
        Self::find_by_id(pool, id).await
    }

    /// Transitions a pending task to running, stamping `started_at`
    ///
    /// Returns `None` when the task is not pending (the guard lost).
    pub async fn mark_running(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'running', started_at = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Self::find_by_id(pool, id).await
    }

    /// Fetches a task on an already-held connection. Used inside
    /// transactions that must read and write under one commit.
    pub async fn find_by_id_on(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .try_map(|row: SqliteRow| Task::from_row(&row))
            .fetch_optional(conn)
            .await
    }

    /// Applies a guarded terminal transition on an already-held
    /// connection
    ///
    /// Completed/failed/timeout require `running`; cancelled is also
    /// reachable from `pending`. Completed forces progress to 100;
    /// everything else freezes progress at its last observed value.
    /// Returns `None` when the guard lost (the row is already terminal),
    /// leaving the row untouched. Callers that must keep the sub-task
    /// mirror consistent run this and the mirror update inside one
    /// [`crate::db::store::Store::transaction`].
    pub async fn apply_terminal(
        conn: &mut SqliteConnection,
        id: &str,
        status: TaskStatus,
    ) -> Result<Option<Self>, sqlx::Error> {
        let sql = match status {
            TaskStatus::Completed => {
                "UPDATE tasks
                 SET status = 'completed', progress = 100, completed_at = ?, updated_at = ?
                 WHERE id = ? AND status = 'running'"
            }
            TaskStatus::Failed => {
                "UPDATE tasks
                 SET status = 'failed', completed_at = ?, updated_at = ?
                 WHERE id = ? AND status = 'running'"
            }
            TaskStatus::Timeout => {
                "UPDATE tasks
                 SET status = 'timeout', completed_at = ?, updated_at = ?
                 WHERE id = ? AND status = 'running'"
            }
            TaskStatus::Cancelled => {
                "UPDATE tasks
                 SET status = 'cancelled', completed_at = ?, updated_at = ?
                 WHERE id = ? AND status IN ('pending', 'running')"
            }
            _ => return Ok(None),
        };

        let now = Utc::now();
        let result = sqlx::query(sql)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Self::find_by_id_on(conn, id).await
    }

    /// Transitions a running task to completed, forcing progress to 100.
    pub async fn mark_completed(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        Self::apply_terminal(&mut conn, id, TaskStatus::Completed).await
    }

    /// Transitions a running task to failed. Progress freezes at its last
    /// observed value.
    pub async fn mark_failed(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        Self::apply_terminal(&mut conn, id, TaskStatus::Failed).await
    }

    /// Transitions a running task to timeout.
    pub async fn mark_timeout(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        Self::apply_terminal(&mut conn, id, TaskStatus::Timeout).await
    }

    /// Transitions a pending or running task to cancelled.
    pub async fn mark_cancelled(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        Self::apply_terminal(&mut conn, id, TaskStatus::Cancelled).await
    }

    /// Updates progress, clamped to 0–100. Running tasks only.
    pub async fn set_progress(
        pool: &SqlitePool,
        id: &str,
        progress: i64,
    ) -> Result<(), sqlx::Error> {
        let progress = progress.clamp(0, 100);
        sqlx::query(
            "UPDATE tasks SET progress = ?, updated_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(progress)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Binds an instance to this task.
    pub async fn bind_instance(
        pool: &SqlitePool,
        id: &str,
        instance_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET instance_id = ?, updated_at = ? WHERE id = ?")
            .bind(instance_id)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Releases the instance binding.
    pub async fn release_instance(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET instance_id = NULL, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Claims the timeout-handled flag
    ///
    /// Single-writer guard: exactly one caller observes `true`; every
    /// later claim (a racing cancel, a late natural exit) observes
    /// `false` and must not apply a second terminal transition.
    pub async fn claim_timeout_handled(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET timeout_handled = 1, updated_at = ?
             WHERE id = ? AND timeout_handled = 0",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Full-text search over task name, description and prompt.
    pub async fn search(
        pool: &SqlitePool,
        query: &str,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query(
            "SELECT tasks.* FROM tasks
             JOIN tasks_fts ON tasks.rowid = tasks_fts.rowid
             WHERE tasks_fts MATCH ?
             ORDER BY tasks_fts.rank
             LIMIT ?",
        )
        .bind(query)
        .bind(limit)
        .try_map(|row: SqliteRow| Task::from_row(&row))
        .fetch_all(pool)
        .await
    }

    /// Deletes a task. Children, logs, results and telemetry cascade.
    /// Returns the number of rows removed (0 when the id is unknown).
    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Counts tasks in a given status.
    pub async fn count_by_status(
        pool: &SqlitePool,
        status: TaskStatus,
    ) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_task_status_is_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_task_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));

        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Timeout));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));

        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Timeout.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_priority_roundtrip() {
        for p in [
            Priority::Low,
            Priority::Medium,
            Priority::High,
            Priority::Critical,
        ] {
            assert_eq!(Priority::parse(p.as_str()), Some(p));
        }
    }

    #[test]
    fn test_execution_mode_roundtrip() {
        assert_eq!(
            ExecutionMode::parse("sequential"),
            Some(ExecutionMode::Sequential)
        );
        assert_eq!(
            ExecutionMode::parse("parallel"),
            Some(ExecutionMode::Parallel)
        );
        assert_eq!(ExecutionMode::parse("both"), None);
    }

    #[test]
    fn test_duration_ms() {
        let now = Utc::now();
        let mut task = Task {
            id: "t".into(),
            parent_id: None,
            status: TaskStatus::Completed,
            progress: 100,
            priority: Priority::Medium,
            execution_mode: ExecutionMode::Sequential,
            name: "t".into(),
            description: String::new(),
            prompt: String::new(),
            work_directory: String::new(),
            return_mode: None,
            metadata: JsonValue::Object(Default::default()),
            instance_id: None,
            timeout_ms: 1000,
            deadline_at: None,
            timeout_handled: false,
            created_at: now,
            started_at: Some(now),
            completed_at: Some(now + Duration::milliseconds(250)),
            updated_at: now,
        };

        assert_eq!(task.duration_ms(), Some(250));

        task.completed_at = None;
        assert_eq!(task.duration_ms(), None);
    }

    #[test]
    fn test_create_task_default_timeout() {
        let data = CreateTask::default();
        assert_eq!(data.timeout_ms, 1_800_000);
        assert_eq!(data.priority, Priority::Medium);
    }
}
