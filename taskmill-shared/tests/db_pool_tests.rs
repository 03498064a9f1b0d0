/// Integration tests for the store connection pool
///
/// Each test opens its own database file inside a temp directory, so the
/// suite runs without any external services.

use std::time::Duration;

use taskmill_shared::db::pool::{
    close_pool, create_pool, get_pool_stats, health_check, DatabaseConfig,
};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.path().join("pool_test.db"),
        min_connections: 1,
        max_connections: 4,
        connection_timeout_ms: 2_000,
        busy_timeout_ms: 1_000,
        idle_timeout_ms: 60_000,
    }
}

#[tokio::test]
async fn test_create_pool_success() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(&test_config(&dir)).await.expect("pool open");

    let stats = get_pool_stats(&pool);
    assert!(stats.total_connections > 0, "pool should hold a connection");

    close_pool(pool).await;
}

#[tokio::test]
async fn test_create_pool_creates_missing_directory() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        path: dir.path().join("nested/deeper/store.db"),
        ..test_config(&dir)
    };

    let pool = create_pool(&config).await.expect("pool open");
    assert!(config.path.exists(), "database file should exist");

    close_pool(pool).await;
}

#[tokio::test]
async fn test_health_check_success() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(&test_config(&dir)).await.unwrap();

    health_check(&pool).await.expect("health check");

    close_pool(pool).await;
}

#[tokio::test]
async fn test_pool_query_execution() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(&test_config(&dir)).await.unwrap();

    let row: (i64,) = sqlx::query_as("SELECT ?")
        .bind(42i64)
        .fetch_one(&pool)
        .await
        .expect("query");

    assert_eq!(row.0, 42);

    close_pool(pool).await;
}

#[tokio::test]
async fn test_wal_journal_mode_active() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(&test_config(&dir)).await.unwrap();

    let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");

    let (fk,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(fk, 1, "foreign keys should be enforced");

    close_pool(pool).await;
}

#[tokio::test]
async fn test_pool_concurrent_queries() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(&test_config(&dir)).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8i64 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let row: (i64,) = sqlx::query_as("SELECT ?")
                .bind(i)
                .fetch_one(&pool)
                .await
                .unwrap();
            row.0
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), i as i64);
    }

    close_pool(pool).await;
}

#[tokio::test]
async fn test_acquire_times_out_when_pool_exhausted() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        max_connections: 1,
        min_connections: 0,
        connection_timeout_ms: 200,
        ..test_config(&dir)
    };
    let pool = create_pool(&config).await.unwrap();

    // Hold the only connection.
    let held = pool.acquire().await.expect("first acquire");

    let started = std::time::Instant::now();
    let second = pool.acquire().await;
    assert!(second.is_err(), "second acquire should time out");
    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "timeout should respect the configured window"
    );

    drop(held);
    close_pool(pool).await;
}
