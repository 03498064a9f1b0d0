/// Sub-task model: the graph-shape record for a root's children
///
/// Each markdown child produces two rows: a `tasks` row carrying execution
/// state (logs, result, instance binding) and a `subtasks` row keyed
/// `(parent_id, ordinal)` carrying the shape of the graph: the dependency
/// list, the execution-mode override and a status/progress mirror that is
/// updated in the same transaction as the child's task row.

use crate::models::task::{ExecutionMode, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

/// Sub-task record, keyed `(parent_id, ordinal)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// Root task id
    pub parent_id: String,

    /// 1-based declaration ordinal within the parent document
    pub ordinal: i64,

    /// Id of the child's `tasks` row
    pub task_id: String,

    /// Sub-task name
    pub name: String,

    /// Sub-task description
    pub description: String,

    /// Execution-mode override; the parent's mode applies when None
    pub execution_mode: Option<ExecutionMode>,

    /// Ids of sibling tasks that must be terminal-success first
    pub dependencies: Vec<String>,

    /// Mirrored status of the child task
    pub status: TaskStatus,

    /// Mirrored progress of the child task
    pub progress: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a sub-task record.
#[derive(Debug, Clone)]
pub struct CreateSubTask {
    pub parent_id: String,
    pub ordinal: i64,
    pub task_id: String,
    pub name: String,
    pub description: String,
    pub execution_mode: Option<ExecutionMode>,
    pub dependencies: Vec<String>,
}

impl SubTask {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = TaskStatus::parse(&status_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown subtask status '{}'", status_str).into())
        })?;

        let deps_str: String = row.try_get("dependencies")?;
        let dependencies: Vec<String> = serde_json::from_str(&deps_str)
            .map_err(|e| sqlx::Error::Decode(format!("bad dependencies json: {}", e).into()))?;

        let execution_mode = row
            .try_get::<Option<String>, _>("execution_mode")?
            .as_deref()
            .and_then(ExecutionMode::parse);

        Ok(SubTask {
            parent_id: row.try_get("parent_id")?,
            ordinal: row.try_get("ordinal")?,
            task_id: row.try_get("task_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            execution_mode,
            dependencies,
            status,
            progress: row.try_get("progress")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Creates a sub-task record in pending state.
    pub async fn create(pool: &SqlitePool, data: CreateSubTask) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        let dependencies_json = serde_json::to_string(&data.dependencies)
            .map_err(|e| sqlx::Error::Decode(format!("bad dependencies: {}", e).into()))?;

        sqlx::query(
            r#"
            INSERT INTO subtasks (
                parent_id, ordinal, task_id, name, description,
                execution_mode, dependencies, status, progress,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(&data.parent_id)
        .bind(data.ordinal)
        .bind(&data.task_id)
        .bind(&data.name)
        .bind(&data.description)
        .bind(data.execution_mode.map(|m| m.as_str()))
        .bind(&dependencies_json)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(SubTask {
            parent_id: data.parent_id,
            ordinal: data.ordinal,
            task_id: data.task_id,
            name: data.name,
            description: data.description,
            execution_mode: data.execution_mode,
            dependencies: data.dependencies,
            status: TaskStatus::Pending,
            progress: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Lists a root's sub-tasks in declaration order.
    pub async fn list_by_parent(
        pool: &SqlitePool,
        parent_id: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query("SELECT * FROM subtasks WHERE parent_id = ? ORDER BY ordinal ASC")
            .bind(parent_id)
            .try_map(|row: SqliteRow| SubTask::from_row(&row))
            .fetch_all(pool)
            .await
    }

    /// Finds the sub-task record for a child task id.
    pub async fn find_by_task_id(
        pool: &SqlitePool,
        task_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query("SELECT * FROM subtasks WHERE task_id = ?")
            .bind(task_id)
            .try_map(|row: SqliteRow| SubTask::from_row(&row))
            .fetch_optional(pool)
            .await
    }

    /// Mirrors the child task's status and progress onto the sub-task row
    ///
    /// Generic over the executor so the mirror can run on the same
    /// transaction connection as the child task's status transition;
    /// a pool reference works for standalone mirror updates.
    pub async fn mirror_status<'e, E>(
        executor: E,
        task_id: &str,
        status: TaskStatus,
        progress: i64,
    ) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            "UPDATE subtasks SET status = ?, progress = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(status.as_str())
        .bind(progress.clamp(0, 100))
        .bind(Utc::now())
        .bind(task_id)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_serialize_to_json_array() {
        let deps = vec!["root-sub-1".to_string(), "root-sub-2".to_string()];
        let json = serde_json::to_string(&deps).unwrap();
        assert_eq!(json, r#"["root-sub-1","root-sub-2"]"#);

        let parsed: Vec<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, deps);
    }
}
