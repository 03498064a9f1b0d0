/// Health tool
///
/// Reports server liveness, the effective execution configuration and
/// store pool statistics.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "version": "0.1.0",
///   "uptimeMs": 12345,
///   "config": {
///     "heartbeatIntervalMs": 15000,
///     "executionTimeoutMs": 1800000,
///     "maxRetries": 3,
///     "retryDelayMs": 1000
///   },
///   "pool": { "size": 2, "idle": 2, "busy": 0 }
/// }
/// ```

use crate::app::AppState;
use crate::error::ErrorBody;
use serde::Serialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_ms: u64,
    config: HealthConfig,
    pool: HealthPool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthConfig {
    heartbeat_interval_ms: u64,
    execution_timeout_ms: u64,
    max_retries: u32,
    retry_delay_ms: u64,
}

#[derive(Debug, Serialize)]
struct HealthPool {
    size: usize,
    idle: usize,
    busy: usize,
}

pub async fn handle(state: &AppState) -> Result<JsonValue, ErrorBody> {
    let stats = state.store.stats();

    let response = HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_ms: state.uptime_ms() as u64,
        config: HealthConfig {
            heartbeat_interval_ms: state.config.heartbeat_interval_ms,
            execution_timeout_ms: state.config.execution_timeout_ms,
            max_retries: state.config.max_retries,
            retry_delay_ms: state.config.retry_delay_ms,
        },
        pool: HealthPool {
            size: stats.total_connections,
            idle: stats.idle_connections,
            busy: stats.busy_connections,
        },
    };

    serde_json::to_value(&response)
        .map_err(|e| ErrorBody::new("internal", format!("failed to encode health: {}", e)))
}
