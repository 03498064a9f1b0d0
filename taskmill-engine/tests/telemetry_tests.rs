/// Rollup job integration tests

use chrono::{Duration, Utc};
use taskmill_engine::telemetry::TelemetryRollup;
use taskmill_shared::db::pool::DatabaseConfig;
use taskmill_shared::db::store::Store;
use taskmill_shared::models::instance::{Instance, InstanceConfig};
use taskmill_shared::models::telemetry::{
    InstanceTelemetry, NewTelemetry, Resolution, TelemetryKind, TimeSeriesMetric,
};
use tempfile::TempDir;

async fn open_store(dir: &TempDir) -> Store {
    Store::open(
        DatabaseConfig {
            path: dir.path().join("telemetry_test.db"),
            min_connections: 1,
            max_connections: 3,
            connection_timeout_ms: 5_000,
            busy_timeout_ms: 2_000,
            idle_timeout_ms: 60_000,
        },
        1,
    )
    .await
    .expect("store open")
}

async fn record(store: &Store, instance_id: &str, kind: TelemetryKind, value: f64) {
    InstanceTelemetry::record(
        store.pool(),
        NewTelemetry::new(kind, value).for_instance(instance_id),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_minute_rollup_folds_samples_once() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let rollup = TelemetryRollup::new(store.pool().clone());

    let instance = Instance::create(store.pool(), InstanceConfig::default()).await.unwrap();
    record(&store, &instance.id, TelemetryKind::Performance, 100.0).await;
    record(&store, &instance.id, TelemetryKind::Performance, 300.0).await;
    record(&store, &instance.id, TelemetryKind::Timeout, 1.0).await;

    let folded = rollup.run_minute_rollup().await.unwrap();
    assert_eq!(folded, 3);

    let since = Utc::now() - Duration::minutes(5);
    let until = Utc::now() + Duration::minutes(5);

    let durations = TimeSeriesMetric::query_range(
        store.pool(),
        "task_duration",
        Resolution::Minute,
        since,
        until,
    )
    .await
    .unwrap();
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].count, 2);
    assert!((durations[0].sum_value - 400.0).abs() < f64::EPSILON);
    assert_eq!(durations[0].min_value, Some(100.0));
    assert_eq!(durations[0].max_value, Some(300.0));

    let counts = TimeSeriesMetric::query_range(
        store.pool(),
        "task_count",
        Resolution::Minute,
        since,
        until,
    )
    .await
    .unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].count, 2);

    let timeouts = TimeSeriesMetric::query_range(
        store.pool(),
        "timeout_count",
        Resolution::Minute,
        since,
        until,
    )
    .await
    .unwrap();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].count, 1);

    // Re-running with no new samples is a no-op: the watermark holds.
    let folded_again = rollup.run_minute_rollup().await.unwrap();
    assert_eq!(folded_again, 0);

    let durations_again = TimeSeriesMetric::query_range(
        store.pool(),
        "task_duration",
        Resolution::Minute,
        since,
        until,
    )
    .await
    .unwrap();
    assert_eq!(durations_again[0].count, 2, "no double counting on re-run");
}

#[tokio::test]
async fn test_new_samples_merge_into_existing_bucket() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let rollup = TelemetryRollup::new(store.pool().clone());

    let instance = Instance::create(store.pool(), InstanceConfig::default()).await.unwrap();
    record(&store, &instance.id, TelemetryKind::Performance, 200.0).await;
    rollup.run_minute_rollup().await.unwrap();

    record(&store, &instance.id, TelemetryKind::Performance, 400.0).await;
    rollup.run_minute_rollup().await.unwrap();

    let since = Utc::now() - Duration::minutes(5);
    let until = Utc::now() + Duration::minutes(5);
    let rows = TimeSeriesMetric::query_range(
        store.pool(),
        "task_duration",
        Resolution::Minute,
        since,
        until,
    )
    .await
    .unwrap();

    // Samples land in the current minute; both runs merged into it.
    let total_count: i64 = rows.iter().map(|r| r.count).sum();
    let total_sum: f64 = rows.iter().map(|r| r.sum_value).sum();
    assert_eq!(total_count, 2);
    assert!((total_sum - 600.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_heartbeats_are_not_rolled_up() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let rollup = TelemetryRollup::new(store.pool().clone());

    let instance = Instance::create(store.pool(), InstanceConfig::default()).await.unwrap();
    record(&store, &instance.id, TelemetryKind::Heartbeat, 1.0).await;
    record(&store, &instance.id, TelemetryKind::Heartbeat, 1.0).await;

    let folded = rollup.run_minute_rollup().await.unwrap();
    assert_eq!(folded, 2, "samples are consumed");

    let (buckets,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM time_series_metrics")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(buckets, 0, "heartbeats produce no metric buckets");
}

#[tokio::test]
async fn test_hourly_rollup_recomputes_idempotently() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let rollup = TelemetryRollup::new(store.pool().clone());

    let instance = Instance::create(store.pool(), InstanceConfig::default()).await.unwrap();
    for value in [100.0, 200.0, 600.0] {
        record(&store, &instance.id, TelemetryKind::Performance, value).await;
    }
    rollup.run_minute_rollup().await.unwrap();

    let since = Utc::now() - Duration::hours(2);
    let until = Utc::now() + Duration::hours(2);

    let written = rollup
        .rollup_to("task_duration", Resolution::Hour, since, until)
        .await
        .unwrap();
    assert_eq!(written, 1);

    let first = TimeSeriesMetric::query_range(
        store.pool(),
        "task_duration",
        Resolution::Hour,
        since,
        until,
    )
    .await
    .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].count, 3);
    assert!((first[0].sum_value - 900.0).abs() < f64::EPSILON);
    assert_eq!(first[0].min_value, Some(100.0));
    assert_eq!(first[0].max_value, Some(600.0));

    // Recomputing overwrites in place instead of merging twice.
    rollup
        .rollup_to("task_duration", Resolution::Hour, since, until)
        .await
        .unwrap();
    let second = TimeSeriesMetric::query_range(
        store.pool(),
        "task_duration",
        Resolution::Hour,
        since,
        until,
    )
    .await
    .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].count, 3);
    assert!((second[0].sum_value - 900.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_minute_is_base_resolution() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let rollup = TelemetryRollup::new(store.pool().clone());

    let since = Utc::now() - Duration::hours(1);
    let until = Utc::now();
    let written = rollup
        .rollup_to("task_duration", Resolution::Minute, since, until)
        .await
        .unwrap();
    assert_eq!(written, 0, "minute buckets come from the periodic job only");
}
