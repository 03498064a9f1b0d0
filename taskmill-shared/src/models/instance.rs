/// Instance model: a supervised child-process slot
///
/// Instances are created on first need, bound to at most one task at a
/// time, and reused from the idle set. Rolling metrics and the slot
/// configuration are stored as JSON blobs and normalized into typed
/// structs at the repository boundary.
///
/// # Metrics invariant
///
/// `total_tasks = successful + failed + timeout + cancelled` holds after
/// every [`Instance::record_outcome`] call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Free for reuse
    Idle,

    /// Currently executing a task
    Running,

    /// Last execution ended in an error; still reusable
    Error,

    /// Shut down; never reused
    Terminated,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Idle => "idle",
            InstanceStatus::Running => "running",
            InstanceStatus::Error => "error",
            InstanceStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(InstanceStatus::Idle),
            "running" => Some(InstanceStatus::Running),
            "error" => Some(InstanceStatus::Error),
            "terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }
}

/// Which terminal bucket an execution landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcomeKind {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

/// Rolling per-instance execution metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceMetrics {
    pub total_tasks: i64,
    pub successful_tasks: i64,
    pub failed_tasks: i64,
    pub timeout_tasks: i64,
    pub cancelled_tasks: i64,

    /// Duration of the most recent task in milliseconds
    pub last_task_time_ms: i64,

    /// Rolling average task duration in milliseconds
    pub avg_task_time_ms: f64,

    /// Cumulative execution time in milliseconds
    pub total_task_time_ms: i64,

    /// failed / total
    pub error_rate: f64,

    /// timeout / total
    pub timeout_rate: f64,
}

impl InstanceMetrics {
    /// Folds one finished execution into the rolling metrics.
    pub fn record(&mut self, outcome: TaskOutcomeKind, duration_ms: i64) {
        self.total_tasks += 1;
        match outcome {
            TaskOutcomeKind::Success => self.successful_tasks += 1,
            TaskOutcomeKind::Failure => self.failed_tasks += 1,
            TaskOutcomeKind::Timeout => self.timeout_tasks += 1,
            TaskOutcomeKind::Cancelled => self.cancelled_tasks += 1,
        }

        self.last_task_time_ms = duration_ms;
        self.total_task_time_ms += duration_ms;
        self.avg_task_time_ms = self.total_task_time_ms as f64 / self.total_tasks as f64;
        self.error_rate = self.failed_tasks as f64 / self.total_tasks as f64;
        self.timeout_rate = self.timeout_tasks as f64 / self.total_tasks as f64;
    }
}

/// Per-instance configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Default per-task timeout in milliseconds
    pub task_timeout_ms: i64,

    /// Default working directory when the task carries none
    pub default_work_directory: String,

    /// Terminate the instance after this many tasks (None = unbounded)
    pub max_tasks: Option<i64>,

    /// Advisory memory cap in bytes (None = unbounded)
    pub max_memory_bytes: Option<i64>,
}

/// A supervised child-process slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub status: InstanceStatus,

    /// Task currently bound to this slot (at most one)
    pub current_task_id: Option<String>,

    pub metrics: InstanceMetrics,
    pub config: InstanceConfig,

    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// Milliseconds since the last heartbeat, if any was ever recorded.
    pub fn heartbeat_age_ms(&self) -> Option<i64> {
        self.last_heartbeat_at
            .map(|at| (Utc::now() - at).num_milliseconds())
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = InstanceStatus::parse(&status_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown instance status '{}'", status_str).into())
        })?;

        let metrics_str: String = row.try_get("metrics")?;
        let metrics: InstanceMetrics = serde_json::from_str(&metrics_str)
            .map_err(|e| sqlx::Error::Decode(format!("bad metrics json: {}", e).into()))?;

        let config_str: String = row.try_get("config")?;
        let config: InstanceConfig = serde_json::from_str(&config_str)
            .map_err(|e| sqlx::Error::Decode(format!("bad config json: {}", e).into()))?;

        Ok(Instance {
            id: row.try_get("id")?,
            status,
            current_task_id: row.try_get("current_task_id")?,
            metrics,
            config,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Creates a new idle instance slot.
    pub async fn create(pool: &SqlitePool, config: InstanceConfig) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        let instance = Instance {
            id: Uuid::new_v4().to_string(),
            status: InstanceStatus::Idle,
            current_task_id: None,
            metrics: InstanceMetrics::default(),
            config,
            created_at: now,
            last_used_at: None,
            last_heartbeat_at: None,
            updated_at: now,
        };

        let metrics_json = serde_json::to_string(&instance.metrics)
            .map_err(|e| sqlx::Error::Decode(format!("bad metrics: {}", e).into()))?;
        let config_json = serde_json::to_string(&instance.config)
            .map_err(|e| sqlx::Error::Decode(format!("bad config: {}", e).into()))?;

        sqlx::query(
            "INSERT INTO instances (id, status, metrics, config, created_at, updated_at)
             VALUES (?, 'idle', ?, ?, ?, ?)",
        )
        .bind(&instance.id)
        .bind(metrics_json)
        .bind(config_json)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(pool)
        .await?;

        Ok(instance)
    }

    /// Finds an instance by id.
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .try_map(|row: SqliteRow| Instance::from_row(&row))
            .fetch_optional(pool)
            .await
    }

    /// Lists idle instances, least-recently used first.
    pub async fn list_idle(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query(
            "SELECT * FROM instances WHERE status = 'idle'
             ORDER BY last_used_at ASC NULLS FIRST",
        )
        .try_map(|row: SqliteRow| Instance::from_row(&row))
        .fetch_all(pool)
        .await
    }

    /// Binds a task to this instance and marks it running.
    pub async fn bind(pool: &SqlitePool, id: &str, task_id: &str) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE instances
             SET status = 'running', current_task_id = ?, last_used_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(task_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Unbinds the current task and returns the slot to idle (or error).
    pub async fn release(
        pool: &SqlitePool,
        id: &str,
        status: InstanceStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE instances
             SET status = ?, current_task_id = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Stamps the heartbeat timestamp.
    pub async fn touch_heartbeat(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query("UPDATE instances SET last_heartbeat_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Folds one finished execution into the stored rolling metrics and
    /// returns the updated snapshot.
    pub async fn record_outcome(
        pool: &SqlitePool,
        id: &str,
        outcome: TaskOutcomeKind,
        duration_ms: i64,
    ) -> Result<InstanceMetrics, sqlx::Error> {
        let instance = Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let mut metrics = instance.metrics;
        metrics.record(outcome, duration_ms);

        let metrics_json = serde_json::to_string(&metrics)
            .map_err(|e| sqlx::Error::Decode(format!("bad metrics: {}", e).into()))?;

        sqlx::query("UPDATE instances SET metrics = ?, updated_at = ? WHERE id = ?")
            .bind(metrics_json)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;

        Ok(metrics)
    }

    /// Marks the instance terminated. Terminated slots are never reused.
    pub async fn terminate(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE instances
             SET status = 'terminated', current_task_id = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_status_roundtrip() {
        for status in [
            InstanceStatus::Idle,
            InstanceStatus::Running,
            InstanceStatus::Error,
            InstanceStatus::Terminated,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_metrics_totals_add_up() {
        let mut metrics = InstanceMetrics::default();
        metrics.record(TaskOutcomeKind::Success, 100);
        metrics.record(TaskOutcomeKind::Failure, 200);
        metrics.record(TaskOutcomeKind::Timeout, 300);
        metrics.record(TaskOutcomeKind::Cancelled, 50);
        metrics.record(TaskOutcomeKind::Success, 150);

        assert_eq!(metrics.total_tasks, 5);
        assert_eq!(
            metrics.total_tasks,
            metrics.successful_tasks
                + metrics.failed_tasks
                + metrics.timeout_tasks
                + metrics.cancelled_tasks
        );
        assert_eq!(metrics.last_task_time_ms, 150);
        assert_eq!(metrics.total_task_time_ms, 800);
        assert!((metrics.avg_task_time_ms - 160.0).abs() < f64::EPSILON);
        assert!((metrics.error_rate - 0.2).abs() < f64::EPSILON);
        assert!((metrics.timeout_rate - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_metrics_deserialize_with_missing_fields() {
        // Old rows may predate newer metric fields; serde defaults fill in.
        let metrics: InstanceMetrics = serde_json::from_str(r#"{"total_tasks": 3}"#).unwrap();
        assert_eq!(metrics.total_tasks, 3);
        assert_eq!(metrics.successful_tasks, 0);
    }

    #[test]
    fn test_instance_config_defaults() {
        let config: InstanceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.task_timeout_ms, 0);
        assert!(config.max_tasks.is_none());
    }
}
