/// Append-only task event log
///
/// Every observable step of a task's life (status changes, progress,
/// heartbeats, errors) lands here. Rows are never updated; clients read
/// them back in insertion order (ids are monotonic per store).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

/// What a log row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Progress,
    Status,
    Heartbeat,
    Error,
    Message,
    System,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Progress => "progress",
            LogKind::Status => "status",
            LogKind::Heartbeat => "heartbeat",
            LogKind::Error => "error",
            LogKind::Message => "message",
            LogKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "progress" => Some(LogKind::Progress),
            "status" => Some(LogKind::Status),
            "heartbeat" => Some(LogKind::Heartbeat),
            "error" => Some(LogKind::Error),
            "message" => Some(LogKind::Message),
            "system" => Some(LogKind::System),
            _ => None,
        }
    }
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// A single append-only log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    /// Monotonic row id
    pub id: i64,

    pub task_id: String,
    pub instance_id: Option<String>,
    pub kind: LogKind,
    pub level: LogLevel,
    pub message: String,

    /// Progress snapshot, when the event carries one
    pub progress: Option<i64>,

    /// Status snapshot, when the event carries one
    pub status: Option<String>,

    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Input for appending a log row.
#[derive(Debug, Clone)]
pub struct NewTaskLog {
    pub task_id: String,
    pub instance_id: Option<String>,
    pub kind: LogKind,
    pub level: LogLevel,
    pub message: String,
    pub progress: Option<i64>,
    pub status: Option<String>,
    pub metadata: JsonValue,
}

impl NewTaskLog {
    /// Shorthand for an info-level log of the given kind.
    pub fn info(task_id: impl Into<String>, kind: LogKind, message: impl Into<String>) -> Self {
        NewTaskLog {
            task_id: task_id.into(),
            instance_id: None,
            kind,
            level: LogLevel::Info,
            message: message.into(),
            progress: None,
            status: None,
            metadata: JsonValue::Object(Default::default()),
        }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_progress(mut self, progress: i64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

impl TaskLog {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let kind_str: String = row.try_get("kind")?;
        let kind = LogKind::parse(&kind_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown log kind '{}'", kind_str).into())
        })?;

        let level_str: String = row.try_get("level")?;
        let level = LogLevel::parse(&level_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown log level '{}'", level_str).into())
        })?;

        let metadata_str: String = row.try_get("metadata")?;
        let metadata: JsonValue = serde_json::from_str(&metadata_str)
            .map_err(|e| sqlx::Error::Decode(format!("bad metadata json: {}", e).into()))?;

        Ok(TaskLog {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            instance_id: row.try_get("instance_id")?,
            kind,
            level,
            message: row.try_get("message")?,
            progress: row.try_get("progress")?,
            status: row.try_get("status")?,
            metadata,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Appends a log row and returns it with its generated id.
    pub async fn append(pool: &SqlitePool, data: NewTaskLog) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        let metadata_json = data.metadata.to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO task_logs (
                task_id, instance_id, kind, level, message,
                progress, status, metadata, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&data.task_id)
        .bind(&data.instance_id)
        .bind(data.kind.as_str())
        .bind(data.level.as_str())
        .bind(&data.message)
        .bind(data.progress)
        .bind(&data.status)
        .bind(&metadata_json)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(TaskLog {
            id: result.last_insert_rowid(),
            task_id: data.task_id,
            instance_id: data.instance_id,
            kind: data.kind,
            level: data.level,
            message: data.message,
            progress: data.progress,
            status: data.status,
            metadata: data.metadata,
            created_at: now,
        })
    }

    /// Lists a task's logs in insertion order, optionally restricted to a
    /// time window.
    pub async fn list_by_task(
        pool: &SqlitePool,
        task_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let mut sql = String::from("SELECT * FROM task_logs WHERE task_id = ?");
        if since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if until.is_some() {
            sql.push_str(" AND created_at <= ?");
        }
        sql.push_str(" ORDER BY id ASC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(task_id);
        if let Some(since) = since {
            query = query.bind(since);
        }
        if let Some(until) = until {
            query = query.bind(until);
        }

        query
            .bind(limit)
            .try_map(|row: SqliteRow| TaskLog::from_row(&row))
            .fetch_all(pool)
            .await
    }

    /// Counts a task's log rows.
    pub async fn count_by_task(pool: &SqlitePool, task_id: &str) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_logs WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}
