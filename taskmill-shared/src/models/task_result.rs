/// Task result: exactly one row per terminal task
///
/// Uniqueness is enforced by the `task_id` unique key; the insert is
/// written with `ON CONFLICT DO NOTHING` so a racing second terminal
/// transition cannot create a duplicate; the first writer's row stands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

/// Terminal outcome recorded with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Error => "error",
            ResultStatus::Timeout => "timeout",
            ResultStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ResultStatus::Success),
            "error" => Some(ResultStatus::Error),
            "timeout" => Some(ResultStatus::Timeout),
            "cancelled" => Some(ResultStatus::Cancelled),
            _ => None,
        }
    }
}

/// The recorded outcome of a terminal task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: i64,
    pub task_id: String,
    pub status: ResultStatus,

    /// Captured stdout of the child (or reduced graph output for roots)
    pub output: String,

    /// Diagnostic text (stderr tail) for non-success outcomes
    pub error: Option<String>,

    pub execution_time_ms: i64,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Input for recording a result.
#[derive(Debug, Clone)]
pub struct NewTaskResult {
    pub task_id: String,
    pub status: ResultStatus,
    pub output: String,
    pub error: Option<String>,
    pub execution_time_ms: i64,
    pub metadata: JsonValue,
}

impl TaskResult {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = ResultStatus::parse(&status_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown result status '{}'", status_str).into())
        })?;

        let metadata_str: String = row.try_get("metadata")?;
        let metadata: JsonValue = serde_json::from_str(&metadata_str)
            .map_err(|e| sqlx::Error::Decode(format!("bad metadata json: {}", e).into()))?;

        Ok(TaskResult {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            status,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            execution_time_ms: row.try_get("execution_time_ms")?,
            metadata,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Records a result. Idempotent: when a row already exists for the
    /// task, the insert is a no-op and `false` is returned.
    pub async fn insert(pool: &SqlitePool, data: NewTaskResult) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_results (
                task_id, status, output, error, execution_time_ms, metadata, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO NOTHING
            "#,
        )
        .bind(&data.task_id)
        .bind(data.status.as_str())
        .bind(&data.output)
        .bind(&data.error)
        .bind(data.execution_time_ms)
        .bind(data.metadata.to_string())
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetches the result for a task, if the task is terminal.
    pub async fn for_task(pool: &SqlitePool, task_id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query("SELECT * FROM task_results WHERE task_id = ?")
            .bind(task_id)
            .try_map(|row: SqliteRow| TaskResult::from_row(&row))
            .fetch_optional(pool)
            .await
    }

    /// Counts result rows for a task (0 or 1 by construction).
    pub async fn count_for_task(pool: &SqlitePool, task_id: &str) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM task_results WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(pool)
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_status_roundtrip() {
        for status in [
            ResultStatus::Success,
            ResultStatus::Error,
            ResultStatus::Timeout,
            ResultStatus::Cancelled,
        ] {
            assert_eq!(ResultStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ResultStatus::parse("ok"), None);
    }
}
