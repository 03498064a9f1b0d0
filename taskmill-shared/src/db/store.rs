/// Store handle: one embedded database behind a pooled connection set
///
/// `Store` is created once at startup and passed explicitly to everything
/// that needs persistence; there is no hidden global. Opening the store
/// ensures the database directory exists, applies the connection pragmas
/// (WAL, NORMAL synchronous, foreign keys, busy timeout), builds the pool
/// and migrates the schema to the requested version.
///
/// # Example
///
/// ```no_run
/// use taskmill_shared::db::store::Store;
/// use taskmill_shared::db::pool::DatabaseConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Store::open(DatabaseConfig::default(), 1).await?;
///
/// let row: (i64,) = sqlx::query_as("SELECT 1")
///     .fetch_one(store.pool())
///     .await?;
///
/// store.close().await;
/// # Ok(())
/// # }
/// ```

use crate::db::migrations::run_migrations;
use crate::db::pool::{close_pool, create_pool, get_pool_stats, DatabaseConfig, PoolStats};
use crate::error::{TaskmillError, TaskmillResult};
use futures::future::BoxFuture;
use sqlx::sqlite::SqlitePool;
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, error};

/// Handle to the embedded store.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens the store and migrates it to `schema_version`
    ///
    /// # Errors
    ///
    /// Open and migration failures are fatal: the caller is expected to
    /// abort startup.
    pub async fn open(config: DatabaseConfig, schema_version: i64) -> TaskmillResult<Self> {
        let pool = create_pool(&config).await?;
        run_migrations(&pool, schema_version).await?;
        Ok(Store { pool })
    }

    /// Wraps an existing pool. Used by tests that manage migration state
    /// themselves.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Store { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs `f` inside a transaction
    ///
    /// Acquires a connection, begins, runs `f`, commits on `Ok`, rolls
    /// back and rethrows on `Err`. The connection is always released back
    /// to the pool.
    pub async fn transaction<T, F>(&self, f: F) -> TaskmillResult<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, TaskmillResult<T>>,
    {
        let mut conn = self.pool.acquire().await.map_err(TaskmillError::from)?;
        let mut tx = conn.begin().await.map_err(TaskmillError::from)?;

        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit().await.map_err(|e| {
                    error!(error = %e, "Transaction commit failed");
                    TaskmillError::from(e)
                })?;
                Ok(value)
            }
            Err(e) => {
                // Explicit rollback so a rollback failure is at least logged;
                // the original error is the one surfaced.
                if let Err(rb) = tx.rollback().await {
                    error!(error = %rb, "Transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Runs a list of statements in a single transaction.
    pub async fn batch<I, S>(&self, statements: I) -> TaskmillResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut conn = self.pool.acquire().await.map_err(TaskmillError::from)?;
        let mut tx = conn.begin().await.map_err(TaskmillError::from)?;

        for stmt in statements {
            sqlx::query(stmt.as_ref())
                .execute(&mut *tx)
                .await
                .map_err(TaskmillError::from)?;
        }

        tx.commit().await.map_err(TaskmillError::from)?;
        Ok(())
    }

    /// Current pool statistics (size / idle / busy).
    pub fn stats(&self) -> PoolStats {
        get_pool_stats(&self.pool)
    }

    /// Closes the pool.
    pub async fn close(self) {
        close_pool(self.pool).await;
    }
}

/// Retries `f` once when the pool times out on acquire
///
/// Acquire timeouts are the one store failure repositories recover from
/// locally; everything else propagates on the first attempt.
pub async fn with_acquire_retry<T, F, Fut>(f: F) -> TaskmillResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = TaskmillResult<T>>,
{
    match f().await {
        Err(TaskmillError::AcquireTimeout) => {
            debug!("Store acquire timed out, retrying once");
            f().await
        }
        other => other,
    }
}
