/// Telemetry rollups: raw samples → bucketed time series
///
/// A periodic job folds new `instance_telemetry` rows into
/// minute-resolution `time_series_metrics`. A high-water mark (the last
/// folded row id, stored in `database_info`) keeps re-runs from
/// double-counting; a run with no new samples is a no-op. Hour, day and
/// month buckets are recomputed on demand from the next finer resolution
/// and overwritten in place, so they are idempotent by construction.
///
/// Sample → metric mapping:
///
/// | Telemetry kind | Metrics emitted               |
/// |----------------|-------------------------------|
/// | performance    | `task_duration`, `task_count` |
/// | timeout        | `timeout_count`               |
/// | error          | `error_count`                 |
/// | resource       | `memory_usage`                |
/// | heartbeat      | (liveness only, not rolled)   |

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::time::Duration;
use taskmill_shared::error::TaskmillResult;
use taskmill_shared::models::telemetry::{
    InstanceTelemetry, Resolution, TelemetryKind, TimeSeriesMetric,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const WATERMARK_KEY: &str = "telemetry_rollup_last_id";
const BATCH_SIZE: i64 = 1_000;

/// Default cadence of the periodic minute rollup.
pub const DEFAULT_ROLLUP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Default, Clone, Copy)]
struct BucketAccumulator {
    count: i64,
    sum: f64,
    min: f64,
    max: f64,
}

impl BucketAccumulator {
    fn fold(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }
}

/// Rollup job over one store.
pub struct TelemetryRollup {
    pool: SqlitePool,
}

impl TelemetryRollup {
    pub fn new(pool: SqlitePool) -> Self {
        TelemetryRollup { pool }
    }

    /// Folds all telemetry recorded since the last run into
    /// minute-resolution buckets. Returns the number of samples folded.
    pub async fn run_minute_rollup(&self) -> TaskmillResult<u64> {
        let mut watermark = self.read_watermark().await?;
        let mut folded: u64 = 0;

        loop {
            let samples = InstanceTelemetry::list_after(&self.pool, watermark, BATCH_SIZE).await?;
            if samples.is_empty() {
                break;
            }

            let mut buckets: HashMap<(&'static str, DateTime<Utc>), BucketAccumulator> =
                HashMap::new();

            for sample in &samples {
                watermark = watermark.max(sample.id);
                let bucket = Resolution::Minute.floor(sample.created_at);

                match sample.kind {
                    TelemetryKind::Performance => {
                        buckets
                            .entry(("task_duration", bucket))
                            .or_default()
                            .fold(sample.value);
                        buckets.entry(("task_count", bucket)).or_default().fold(1.0);
                    }
                    TelemetryKind::Timeout => {
                        buckets.entry(("timeout_count", bucket)).or_default().fold(1.0);
                    }
                    TelemetryKind::Error => {
                        buckets.entry(("error_count", bucket)).or_default().fold(1.0);
                    }
                    TelemetryKind::Resource => {
                        buckets
                            .entry(("memory_usage", bucket))
                            .or_default()
                            .fold(sample.value);
                    }
                    TelemetryKind::Heartbeat => {}
                }
            }

            for ((metric_type, bucket), acc) in buckets {
                TimeSeriesMetric::upsert_bucket(
                    &self.pool,
                    metric_type,
                    Resolution::Minute,
                    bucket,
                    acc.count,
                    acc.sum,
                    acc.min,
                    acc.max,
                )
                .await?;
            }

            folded += samples.len() as u64;
            self.write_watermark(watermark).await?;
        }

        if folded > 0 {
            debug!(samples = folded, "Telemetry rollup folded samples");
        }
        Ok(folded)
    }

    /// Recomputes `resolution` buckets inside a window from the next
    /// finer resolution. Idempotent: buckets are overwritten in place.
    pub async fn rollup_to(
        &self,
        metric_type: &str,
        resolution: Resolution,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> TaskmillResult<usize> {
        let Some(finer) = resolution.finer() else {
            // Minute is the base resolution; the periodic job owns it.
            return Ok(0);
        };

        let rows =
            TimeSeriesMetric::query_range(&self.pool, metric_type, finer, since, until).await?;

        let mut buckets: HashMap<DateTime<Utc>, BucketAccumulator> = HashMap::new();
        for row in &rows {
            let bucket = resolution.floor(row.timestamp);
            let acc = buckets.entry(bucket).or_default();
            if acc.count == 0 {
                acc.min = row.min_value.unwrap_or(row.value);
                acc.max = row.max_value.unwrap_or(row.value);
            } else {
                acc.min = acc.min.min(row.min_value.unwrap_or(row.value));
                acc.max = acc.max.max(row.max_value.unwrap_or(row.value));
            }
            acc.count += row.count;
            acc.sum += row.sum_value;
        }

        let written = buckets.len();
        for (bucket, acc) in buckets {
            TimeSeriesMetric::replace_bucket(
                &self.pool,
                metric_type,
                resolution,
                bucket,
                acc.count,
                acc.sum,
                acc.min,
                acc.max,
            )
            .await?;
        }

        Ok(written)
    }

    /// Spawns the periodic minute rollup.
    pub fn spawn_periodic(self, interval_ms: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_millis(interval_ms.max(1_000));
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_minute_rollup().await {
                    warn!(error = %e, "Telemetry rollup failed");
                }
            }
        })
    }

    async fn read_watermark(&self) -> TaskmillResult<i64> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM database_info WHERE key = ?")
                .bind(WATERMARK_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(taskmill_shared::error::TaskmillError::from)?;

        Ok(row.and_then(|(v,)| v.parse().ok()).unwrap_or(0))
    }

    async fn write_watermark(&self, watermark: i64) -> TaskmillResult<()> {
        sqlx::query(
            "INSERT INTO database_info (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
        )
        .bind(WATERMARK_KEY)
        .bind(watermark.to_string())
        .execute(&self.pool)
        .await
        .map_err(taskmill_shared::error::TaskmillError::from)?;
        Ok(())
    }
}
