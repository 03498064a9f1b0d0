/// Schema migration runner for the embedded store
///
/// Migrations are versioned forward/backward statement pairs applied on a
/// supplied connection. The current schema version lives in the
/// `database_info` key/value table under the `schema_version` key; running
/// the migrator moves the store from the recorded version to the requested
/// target, one version per transaction. A failed migration rolls the
/// transaction back and leaves the recorded version untouched.
///
/// # Example
///
/// ```no_run
/// use taskmill_shared::db::pool::{create_pool, DatabaseConfig};
/// use taskmill_shared::db::migrations::{run_migrations, current_version};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = create_pool(&DatabaseConfig::default()).await?;
///
/// run_migrations(&pool, 1).await?;
/// assert_eq!(current_version(&pool).await?, 1);
/// # Ok(())
/// # }
/// ```

use crate::error::TaskmillError;
use sqlx::sqlite::SqlitePool;
use sqlx::Connection;
use tracing::{debug, info, warn};

/// A single schema version step: forward and backward statement lists.
pub struct Migration {
    /// Version this migration moves the schema up to
    pub version: i64,

    /// Short human name for logs
    pub name: &'static str,

    /// Statements applied when migrating up to `version`
    pub up: &'static [&'static str],

    /// Statements applied when migrating back down from `version`
    pub down: &'static [&'static str],
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Schema version currently recorded in the store
    pub current_version: i64,

    /// Highest version this binary knows how to reach
    pub latest_version: i64,

    /// Whether the store matches the latest known version
    pub is_up_to_date: bool,
}

const V1_UP: &[&str] = &[
    // Instance slots are created before tasks so the task -> instance
    // foreign key resolves. The reverse edge (current_task_id) is kept
    // unconstrained to break the reference cycle.
    "CREATE TABLE IF NOT EXISTS instances (
        id                TEXT PRIMARY KEY,
        status            TEXT NOT NULL DEFAULT 'idle',
        current_task_id   TEXT,
        metrics           TEXT NOT NULL DEFAULT '{}',
        config            TEXT NOT NULL DEFAULT '{}',
        created_at        TEXT NOT NULL,
        last_used_at      TEXT,
        last_heartbeat_at TEXT,
        updated_at        TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        id              TEXT PRIMARY KEY,
        parent_id       TEXT REFERENCES tasks(id) ON DELETE CASCADE,
        status          TEXT NOT NULL DEFAULT 'pending',
        progress        INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
        priority        TEXT NOT NULL DEFAULT 'medium',
        execution_mode  TEXT NOT NULL DEFAULT 'sequential',
        name            TEXT NOT NULL,
        description     TEXT NOT NULL DEFAULT '',
        prompt          TEXT NOT NULL DEFAULT '',
        work_directory  TEXT NOT NULL DEFAULT '',
        return_mode     TEXT,
        metadata        TEXT NOT NULL DEFAULT '{}',
        instance_id     TEXT REFERENCES instances(id) ON DELETE SET NULL,
        timeout_ms      INTEGER NOT NULL DEFAULT 1800000,
        deadline_at     TEXT,
        timeout_handled INTEGER NOT NULL DEFAULT 0,
        created_at      TEXT NOT NULL,
        started_at      TEXT,
        completed_at    TEXT,
        updated_at      TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS subtasks (
        parent_id       TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        ordinal         INTEGER NOT NULL,
        task_id         TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        name            TEXT NOT NULL,
        description     TEXT NOT NULL DEFAULT '',
        execution_mode  TEXT,
        dependencies    TEXT NOT NULL DEFAULT '[]',
        status          TEXT NOT NULL DEFAULT 'pending',
        progress        INTEGER NOT NULL DEFAULT 0,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        PRIMARY KEY (parent_id, ordinal)
    )",
    "CREATE TABLE IF NOT EXISTS task_logs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id     TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        instance_id TEXT REFERENCES instances(id) ON DELETE SET NULL,
        kind        TEXT NOT NULL,
        level       TEXT NOT NULL DEFAULT 'info',
        message     TEXT NOT NULL,
        progress    INTEGER,
        status      TEXT,
        metadata    TEXT NOT NULL DEFAULT '{}',
        created_at  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS task_results (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id           TEXT NOT NULL UNIQUE REFERENCES tasks(id) ON DELETE CASCADE,
        status            TEXT NOT NULL,
        output            TEXT NOT NULL DEFAULT '',
        error             TEXT,
        execution_time_ms INTEGER NOT NULL DEFAULT 0,
        metadata          TEXT NOT NULL DEFAULT '{}',
        created_at        TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS instance_telemetry (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_id TEXT REFERENCES instances(id) ON DELETE SET NULL,
        task_id     TEXT REFERENCES tasks(id) ON DELETE CASCADE,
        kind        TEXT NOT NULL,
        value       REAL NOT NULL DEFAULT 0,
        metadata    TEXT NOT NULL DEFAULT '{}',
        created_at  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS time_series_metrics (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        metric_type TEXT NOT NULL,
        timestamp   TEXT NOT NULL,
        resolution  TEXT NOT NULL,
        value       REAL NOT NULL DEFAULT 0,
        count       INTEGER NOT NULL DEFAULT 0,
        min_value   REAL,
        max_value   REAL,
        avg_value   REAL,
        sum_value   REAL NOT NULL DEFAULT 0,
        metadata    TEXT NOT NULL DEFAULT '{}',
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        UNIQUE (metric_type, resolution, timestamp)
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_instance ON tasks(instance_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_updated ON tasks(updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_subtasks_task ON subtasks(task_id)",
    "CREATE INDEX IF NOT EXISTS idx_task_logs_task_time ON task_logs(task_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_instance_kind ON instance_telemetry(instance_id, kind)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_created ON instance_telemetry(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_metrics_bucket ON time_series_metrics(metric_type, timestamp, resolution)",
    // Full-text index over task content, kept in sync by triggers.
    "CREATE VIRTUAL TABLE IF NOT EXISTS tasks_fts USING fts5(
        name, description, prompt,
        content='tasks', content_rowid='rowid',
        tokenize='porter unicode61'
    )",
    "CREATE TRIGGER IF NOT EXISTS tasks_fts_ai AFTER INSERT ON tasks BEGIN
        INSERT INTO tasks_fts(rowid, name, description, prompt)
        VALUES (new.rowid, new.name, new.description, new.prompt);
    END",
    "CREATE TRIGGER IF NOT EXISTS tasks_fts_ad AFTER DELETE ON tasks BEGIN
        INSERT INTO tasks_fts(tasks_fts, rowid, name, description, prompt)
        VALUES ('delete', old.rowid, old.name, old.description, old.prompt);
    END",
    "CREATE TRIGGER IF NOT EXISTS tasks_fts_au AFTER UPDATE ON tasks BEGIN
        INSERT INTO tasks_fts(tasks_fts, rowid, name, description, prompt)
        VALUES ('delete', old.rowid, old.name, old.description, old.prompt);
        INSERT INTO tasks_fts(rowid, name, description, prompt)
        VALUES (new.rowid, new.name, new.description, new.prompt);
    END",
];

const V1_DOWN: &[&str] = &[
    "DROP TRIGGER IF EXISTS tasks_fts_au",
    "DROP TRIGGER IF EXISTS tasks_fts_ad",
    "DROP TRIGGER IF EXISTS tasks_fts_ai",
    "DROP TABLE IF EXISTS tasks_fts",
    "DROP TABLE IF EXISTS time_series_metrics",
    "DROP TABLE IF EXISTS instance_telemetry",
    "DROP TABLE IF EXISTS task_results",
    "DROP TABLE IF EXISTS task_logs",
    "DROP TABLE IF EXISTS subtasks",
    "DROP TABLE IF EXISTS tasks",
    "DROP TABLE IF EXISTS instances",
];

/// All known migrations, ascending by version.
pub fn all_migrations() -> &'static [Migration] {
    const MIGRATIONS: &[Migration] = &[Migration {
        version: 1,
        name: "initial schema",
        up: V1_UP,
        down: V1_DOWN,
    }];
    MIGRATIONS
}

/// Highest schema version this binary can migrate to.
pub fn latest_version() -> i64 {
    all_migrations().last().map(|m| m.version).unwrap_or(0)
}

/// Reads the schema version recorded in `database_info` (0 when the table
/// or key does not exist yet).
pub async fn current_version(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    ensure_info_table(pool).await?;

    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM database_info WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await?;

    Ok(row
        .and_then(|(v,)| v.parse::<i64>().ok())
        .unwrap_or(0))
}

/// Runs migrations from the recorded version to `target`
///
/// Each version step runs inside its own transaction: all statements of
/// the step plus the `schema_version` bump commit atomically. Requesting
/// a `target` below the recorded version applies the backward statements
/// in descending order.
///
/// # Errors
///
/// Returns [`TaskmillError::MigrationFailed`] if `target` is unknown or a
/// statement fails; the failing step is rolled back.
pub async fn run_migrations(pool: &SqlitePool, target: i64) -> Result<(), TaskmillError> {
    if target > latest_version() || target < 0 {
        return Err(TaskmillError::MigrationFailed(format!(
            "unknown target schema version {} (latest known: {})",
            target,
            latest_version()
        )));
    }

    let current = current_version(pool).await.map_err(|e| {
        TaskmillError::MigrationFailed(format!("failed to read schema version: {}", e))
    })?;

    if current == target {
        debug!(version = current, "Schema already at target version");
        return Ok(());
    }

    info!(from = current, to = target, "Running schema migrations");

    if current < target {
        for migration in all_migrations()
            .iter()
            .filter(|m| m.version > current && m.version <= target)
        {
            apply_step(pool, migration, true).await?;
        }
    } else {
        for migration in all_migrations()
            .iter()
            .rev()
            .filter(|m| m.version <= current && m.version > target)
        {
            apply_step(pool, migration, false).await?;
        }
    }

    info!(version = target, "Schema migrations complete");
    Ok(())
}

/// Gets the current migration status.
pub async fn migration_status(pool: &SqlitePool) -> Result<MigrationStatus, sqlx::Error> {
    let current = current_version(pool).await?;
    let latest = latest_version();

    Ok(MigrationStatus {
        current_version: current,
        latest_version: latest,
        is_up_to_date: current == latest,
    })
}

async fn ensure_info_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS database_info (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn apply_step(
    pool: &SqlitePool,
    migration: &Migration,
    forward: bool,
) -> Result<(), TaskmillError> {
    let statements = if forward { migration.up } else { migration.down };
    let new_version = if forward {
        migration.version
    } else {
        migration.version - 1
    };

    debug!(
        version = migration.version,
        name = migration.name,
        forward,
        "Applying migration step"
    );

    let mut conn = pool.acquire().await.map_err(|e| {
        TaskmillError::MigrationFailed(format!("failed to acquire connection: {}", e))
    })?;

    let mut tx = conn.begin().await.map_err(|e| {
        TaskmillError::MigrationFailed(format!("failed to begin transaction: {}", e))
    })?;

    for stmt in statements {
        if let Err(e) = sqlx::query(stmt).execute(&mut *tx).await {
            warn!(
                version = migration.version,
                name = migration.name,
                error = %e,
                "Migration statement failed, rolling back"
            );
            // Rollback happens on drop; surface the original error.
            return Err(TaskmillError::MigrationFailed(format!(
                "migration v{} ({}) failed: {}",
                migration.version, migration.name, e
            )));
        }
    }

    sqlx::query(
        "INSERT INTO database_info (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = ?1",
    )
    .bind(new_version.to_string())
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        TaskmillError::MigrationFailed(format!("failed to record schema version: {}", e))
    })?;

    tx.commit().await.map_err(|e| {
        TaskmillError::MigrationFailed(format!(
            "failed to commit migration v{}: {}",
            migration.version, e
        ))
    })?;

    Ok(())
}
