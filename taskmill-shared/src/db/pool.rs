/// Connection pool management for the embedded store
///
/// This module provides a production-grade SQLite connection pool using sqlx.
/// Pool bounds, acquire timeouts and idle reaping come from [`DatabaseConfig`];
/// every connection is opened with write-ahead journaling, NORMAL synchronous
/// mode, foreign-key enforcement and a busy timeout.
///
/// # Example
///
/// ```no_run
/// use taskmill_shared::db::pool::{create_pool, DatabaseConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DatabaseConfig {
///         path: "/tmp/taskmill/taskmill.db".into(),
///         ..Default::default()
///     };
///
///     let pool = create_pool(&config).await?;
///
///     let row: (i64,) = sqlx::query_as("SELECT ?")
///         .bind(42i64)
///         .fetch_one(&pool)
///         .await?;
///
///     Ok(())
/// }
/// ```

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for the embedded store pool
///
/// All timeouts are in milliseconds to match the server configuration
/// surface.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path of the database file. Parent directories are created on open.
    pub path: PathBuf,

    /// Minimum number of live connections to maintain
    ///
    /// The idle sweep never closes connections below this floor.
    pub min_connections: u32,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// How long a waiter may block on acquire before failing (ms)
    pub connection_timeout_ms: u64,

    /// SQLite busy handler window before a locked statement fails (ms)
    pub busy_timeout_ms: u64,

    /// How long a connection may sit idle before the periodic sweep
    /// closes it (ms)
    pub idle_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("taskmill.db"),
            min_connections: 2,
            max_connections: 10,
            connection_timeout_ms: 30_000,
            busy_timeout_ms: 5_000,
            idle_timeout_ms: 600_000,
        }
    }
}

impl DatabaseConfig {
    /// Builds the per-connection options: WAL journaling, NORMAL
    /// synchronous commit, foreign keys on, busy timeout set.
    pub fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(self.busy_timeout_ms))
    }
}

/// Creates and initializes the store connection pool
///
/// This function:
/// 1. Ensures the database directory exists
/// 2. Creates a pool with the configured bounds and timeouts
/// 3. Performs a health check to verify the store is usable
///
/// # Errors
///
/// Returns an error if the directory cannot be created, the database file
/// cannot be opened, or the health check fails.
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = config.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                sqlx::Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ),
                ))
            })?;
        }
    }

    info!(
        path = %config.path.display(),
        min_connections = config.min_connections,
        max_connections = config.max_connections,
        connection_timeout_ms = config.connection_timeout_ms,
        "Creating store connection pool"
    );

    let pool = SqlitePoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_millis(config.connection_timeout_ms))
        .idle_timeout(Duration::from_millis(config.idle_timeout_ms))
        .connect_with(config.connect_options())
        .await?;

    health_check(&pool).await?;

    info!("Store connection pool created successfully");
    Ok(pool)
}

/// Performs a health check against the store
///
/// Executes a trivial query to verify the database file is reachable and
/// responding.
pub async fn health_check(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    debug!("Performing store health check");

    let result: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;

    if result.0 == 1 {
        debug!("Store health check passed");
        Ok(())
    } else {
        Err(sqlx::Error::Protocol(
            "health check returned unexpected value".into(),
        ))
    }
}

/// Pool statistics snapshot for monitoring and the `health` tool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Number of connections currently checked out
    pub busy_connections: usize,

    /// Number of idle connections available
    pub idle_connections: usize,

    /// Total connections in the pool
    pub total_connections: usize,
}

/// Gets current pool statistics.
pub fn get_pool_stats(pool: &SqlitePool) -> PoolStats {
    let size = pool.size() as usize;
    let idle = pool.num_idle();

    PoolStats {
        busy_connections: size.saturating_sub(idle),
        idle_connections: idle,
        total_connections: size,
    }
}

/// Gracefully closes the connection pool
///
/// Called during shutdown so WAL checkpointing and connection teardown run
/// before the process exits.
pub async fn close_pool(pool: SqlitePool) {
    info!("Closing store connection pool");
    pool.close().await;
    info!("Store connection pool closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.connection_timeout_ms, 30_000);
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn test_database_config_clone() {
        let config = DatabaseConfig::default();
        let cloned = config.clone();
        assert_eq!(config.path, cloned.path);
        assert_eq!(config.max_connections, cloned.max_connections);
    }

    // Pool behavior against a real database file is covered in
    // tests/db_pool_tests.rs.
}
