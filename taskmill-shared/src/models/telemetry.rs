/// Telemetry models: raw instance samples and bucketed time-series rollups
///
/// `InstanceTelemetry` rows are append-only samples emitted by the
/// supervisor (heartbeats, timeouts, per-task performance, errors).
/// `TimeSeriesMetric` rows are bucketed aggregates produced by the rollup
/// job; the bucket key `(metric_type, resolution, timestamp)` is unique
/// and merges are additive on count/sum and extremal on min/max.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

/// Kind of raw telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    Heartbeat,
    Timeout,
    Performance,
    Resource,
    Error,
}

impl TelemetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Heartbeat => "heartbeat",
            TelemetryKind::Timeout => "timeout",
            TelemetryKind::Performance => "performance",
            TelemetryKind::Resource => "resource",
            TelemetryKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "heartbeat" => Some(TelemetryKind::Heartbeat),
            "timeout" => Some(TelemetryKind::Timeout),
            "performance" => Some(TelemetryKind::Performance),
            "resource" => Some(TelemetryKind::Resource),
            "error" => Some(TelemetryKind::Error),
            _ => None,
        }
    }
}

/// A raw telemetry sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTelemetry {
    pub id: i64,
    pub instance_id: Option<String>,
    pub task_id: Option<String>,
    pub kind: TelemetryKind,
    pub value: f64,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Input for recording a sample.
#[derive(Debug, Clone)]
pub struct NewTelemetry {
    pub instance_id: Option<String>,
    pub task_id: Option<String>,
    pub kind: TelemetryKind,
    pub value: f64,
    pub metadata: JsonValue,
}

impl NewTelemetry {
    pub fn new(kind: TelemetryKind, value: f64) -> Self {
        NewTelemetry {
            instance_id: None,
            task_id: None,
            kind,
            value,
            metadata: JsonValue::Object(Default::default()),
        }
    }

    pub fn for_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Aggregate over a set of raw samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryAggregate {
    pub count: i64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
}

impl InstanceTelemetry {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let kind_str: String = row.try_get("kind")?;
        let kind = TelemetryKind::parse(&kind_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown telemetry kind '{}'", kind_str).into())
        })?;

        let metadata_str: String = row.try_get("metadata")?;
        let metadata: JsonValue = serde_json::from_str(&metadata_str)
            .map_err(|e| sqlx::Error::Decode(format!("bad metadata json: {}", e).into()))?;

        Ok(InstanceTelemetry {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            task_id: row.try_get("task_id")?,
            kind,
            value: row.try_get("value")?,
            metadata,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Records a sample.
    pub async fn record(pool: &SqlitePool, data: NewTelemetry) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO instance_telemetry (instance_id, task_id, kind, value, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&data.instance_id)
        .bind(&data.task_id)
        .bind(data.kind.as_str())
        .bind(data.value)
        .bind(data.metadata.to_string())
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Aggregates an instance's samples of one kind over a time window.
    pub async fn aggregate(
        pool: &SqlitePool,
        instance_id: &str,
        kind: TelemetryKind,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<TelemetryAggregate, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count, COALESCE(SUM(value), 0) AS sum,
                    MIN(value) AS min, MAX(value) AS max, AVG(value) AS avg
             FROM instance_telemetry
             WHERE instance_id = ? AND kind = ? AND created_at >= ? AND created_at <= ?",
        )
        .bind(instance_id)
        .bind(kind.as_str())
        .bind(since)
        .bind(until)
        .fetch_one(pool)
        .await?;

        Ok(TelemetryAggregate {
            count: row.try_get("count")?,
            sum: row.try_get("sum")?,
            min: row.try_get("min")?,
            max: row.try_get("max")?,
            avg: row.try_get("avg")?,
        })
    }

    /// Lists samples with ids above `after_id`, oldest first. The rollup
    /// job uses this to fold only not-yet-rolled-up rows.
    pub async fn list_after(
        pool: &SqlitePool,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query("SELECT * FROM instance_telemetry WHERE id > ? ORDER BY id ASC LIMIT ?")
            .bind(after_id)
            .bind(limit)
            .try_map(|row: SqliteRow| InstanceTelemetry::from_row(&row))
            .fetch_all(pool)
            .await
    }
}

/// Bucket width of a time-series row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Minute,
    Hour,
    Day,
    Month,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
            Resolution::Day => "day",
            Resolution::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(Resolution::Minute),
            "hour" => Some(Resolution::Hour),
            "day" => Some(Resolution::Day),
            "month" => Some(Resolution::Month),
            _ => None,
        }
    }

    /// The next finer resolution coarser rollups are computed from.
    pub fn finer(&self) -> Option<Resolution> {
        match self {
            Resolution::Minute => None,
            Resolution::Hour => Some(Resolution::Minute),
            Resolution::Day => Some(Resolution::Hour),
            Resolution::Month => Some(Resolution::Day),
        }
    }

    /// Floors a timestamp to the start of its bucket.
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Resolution::Minute => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), ts.minute(), 0)
                .single()
                .unwrap_or(ts),
            Resolution::Hour => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
                .single()
                .unwrap_or(ts),
            Resolution::Day => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0)
                .single()
                .unwrap_or(ts),
            Resolution::Month => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(ts),
        }
    }
}

/// A bucketed time-series aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesMetric {
    pub id: i64,
    pub metric_type: String,
    pub timestamp: DateTime<Utc>,
    pub resolution: Resolution,

    /// Representative value for the bucket (the running average)
    pub value: f64,

    pub count: i64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub avg_value: Option<f64>,
    pub sum_value: f64,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TimeSeriesMetric {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let resolution_str: String = row.try_get("resolution")?;
        let resolution = Resolution::parse(&resolution_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown resolution '{}'", resolution_str).into())
        })?;

        let metadata_str: String = row.try_get("metadata")?;
        let metadata: JsonValue = serde_json::from_str(&metadata_str)
            .map_err(|e| sqlx::Error::Decode(format!("bad metadata json: {}", e).into()))?;

        Ok(TimeSeriesMetric {
            id: row.try_get("id")?,
            metric_type: row.try_get("metric_type")?,
            timestamp: row.try_get("timestamp")?,
            resolution,
            value: row.try_get("value")?,
            count: row.try_get("count")?,
            min_value: row.try_get("min_value")?,
            max_value: row.try_get("max_value")?,
            avg_value: row.try_get("avg_value")?,
            sum_value: row.try_get("sum_value")?,
            metadata,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Merges an aggregate into a bucket, creating it when absent
    ///
    /// Count and sum add; min/max extend; value and avg are recomputed
    /// from the merged sums so repeated merges stay consistent.
    pub async fn upsert_bucket(
        pool: &SqlitePool,
        metric_type: &str,
        resolution: Resolution,
        bucket: DateTime<Utc>,
        count: i64,
        sum: f64,
        min: f64,
        max: f64,
    ) -> Result<(), sqlx::Error> {
        if count <= 0 {
            return Ok(());
        }
        let now = Utc::now();
        let avg = sum / count as f64;

        sqlx::query(
            r#"
            INSERT INTO time_series_metrics (
                metric_type, timestamp, resolution, value, count,
                min_value, max_value, avg_value, sum_value,
                metadata, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', ?, ?)
            ON CONFLICT(metric_type, resolution, timestamp) DO UPDATE SET
                count     = count + excluded.count,
                sum_value = sum_value + excluded.sum_value,
                min_value = MIN(COALESCE(min_value, excluded.min_value), excluded.min_value),
                max_value = MAX(COALESCE(max_value, excluded.max_value), excluded.max_value),
                avg_value = (sum_value + excluded.sum_value) / (count + excluded.count),
                value     = (sum_value + excluded.sum_value) / (count + excluded.count),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(metric_type)
        .bind(resolution.floor(bucket))
        .bind(resolution.as_str())
        .bind(avg)
        .bind(count)
        .bind(min)
        .bind(max)
        .bind(avg)
        .bind(sum)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Overwrites a bucket with a recomputed aggregate
    ///
    /// Used by coarse rollups, which recompute their buckets from the
    /// finer resolution in full; overwriting keeps repeated runs
    /// idempotent.
    pub async fn replace_bucket(
        pool: &SqlitePool,
        metric_type: &str,
        resolution: Resolution,
        bucket: DateTime<Utc>,
        count: i64,
        sum: f64,
        min: f64,
        max: f64,
    ) -> Result<(), sqlx::Error> {
        if count <= 0 {
            return Ok(());
        }
        let now = Utc::now();
        let avg = sum / count as f64;

        sqlx::query(
            r#"
            INSERT INTO time_series_metrics (
                metric_type, timestamp, resolution, value, count,
                min_value, max_value, avg_value, sum_value,
                metadata, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', ?, ?)
            ON CONFLICT(metric_type, resolution, timestamp) DO UPDATE SET
                count      = excluded.count,
                sum_value  = excluded.sum_value,
                min_value  = excluded.min_value,
                max_value  = excluded.max_value,
                avg_value  = excluded.avg_value,
                value      = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(metric_type)
        .bind(resolution.floor(bucket))
        .bind(resolution.as_str())
        .bind(avg)
        .bind(count)
        .bind(min)
        .bind(max)
        .bind(avg)
        .bind(sum)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Lists buckets of one metric type and resolution inside a window,
    /// oldest first.
    pub async fn query_range(
        pool: &SqlitePool,
        metric_type: &str,
        resolution: Resolution,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query(
            "SELECT * FROM time_series_metrics
             WHERE metric_type = ? AND resolution = ? AND timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp ASC",
        )
        .bind(metric_type)
        .bind(resolution.as_str())
        .bind(since)
        .bind(until)
        .try_map(|row: SqliteRow| TimeSeriesMetric::from_row(&row))
        .fetch_all(pool)
        .await
    }
}
