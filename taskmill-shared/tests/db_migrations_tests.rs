/// Integration tests for the schema migration runner

use taskmill_shared::db::migrations::{
    current_version, latest_version, migration_status, run_migrations,
};
use taskmill_shared::db::pool::{create_pool, DatabaseConfig};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.path().join("migrations_test.db"),
        min_connections: 1,
        max_connections: 2,
        connection_timeout_ms: 2_000,
        busy_timeout_ms: 1_000,
        idle_timeout_ms: 60_000,
    }
}

#[tokio::test]
async fn test_fresh_database_starts_at_version_zero() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(&test_config(&dir)).await.unwrap();

    assert_eq!(current_version(&pool).await.unwrap(), 0);

    let status = migration_status(&pool).await.unwrap();
    assert!(!status.is_up_to_date);
    assert_eq!(status.latest_version, latest_version());
}

#[tokio::test]
async fn test_migrate_to_latest_creates_schema() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(&test_config(&dir)).await.unwrap();

    run_migrations(&pool, latest_version()).await.expect("migrate up");
    assert_eq!(current_version(&pool).await.unwrap(), latest_version());

    // Core tables exist and accept queries.
    for table in [
        "tasks",
        "subtasks",
        "instances",
        "task_logs",
        "task_results",
        "instance_telemetry",
        "time_series_metrics",
    ] {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&pool).await.unwrap();
        assert_eq!(count, 0, "table {} should exist and be empty", table);
    }
}

#[tokio::test]
async fn test_migration_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(&test_config(&dir)).await.unwrap();

    run_migrations(&pool, 1).await.unwrap();

    // Insert a row, re-run the migrator, verify nothing was recreated.
    sqlx::query(
        "INSERT INTO tasks (id, name, created_at, updated_at)
         VALUES ('t1', 'probe', datetime('now'), datetime('now'))",
    )
    .execute(&pool)
    .await
    .unwrap();

    run_migrations(&pool, 1).await.expect("second run is a no-op");

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1, "re-running the target version must not touch data");
    assert_eq!(current_version(&pool).await.unwrap(), 1);
}

#[tokio::test]
async fn test_downgrade_drops_schema() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(&test_config(&dir)).await.unwrap();

    run_migrations(&pool, 1).await.unwrap();
    run_migrations(&pool, 0).await.expect("migrate down");

    assert_eq!(current_version(&pool).await.unwrap(), 0);

    let result = sqlx::query("SELECT COUNT(*) FROM tasks").fetch_one(&pool).await;
    assert!(result.is_err(), "tasks table should be gone after downgrade");

    // And back up again.
    run_migrations(&pool, 1).await.expect("re-migrate up");
    assert_eq!(current_version(&pool).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_target_version_fails() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(&test_config(&dir)).await.unwrap();

    let result = run_migrations(&pool, latest_version() + 10).await;
    assert!(result.is_err(), "unknown target must be rejected");
    assert_eq!(current_version(&pool).await.unwrap(), 0);
}
