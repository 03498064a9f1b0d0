/// Configuration management for the Taskmill server
///
/// Configuration is read once at startup from environment variables (a
/// `.env` file is honored in development) and held as an immutable value
/// for the life of the process.
///
/// # Environment Variables
///
/// | Variable                         | Default                       |
/// |----------------------------------|-------------------------------|
/// | `TASKMILL_DEBUG`                 | `false`                       |
/// | `TASKMILL_HEARTBEAT_INTERVAL_MS` | `15000`                       |
/// | `TASKMILL_EXECUTION_TIMEOUT_MS`  | `1800000`                     |
/// | `TASKMILL_MAX_RETRIES`           | `3`                           |
/// | `TASKMILL_RETRY_DELAY_MS`        | `1000`                        |
/// | `TASKMILL_DB_PATH`               | `$HOME/.taskmill/taskmill.db` |
/// | `TASKMILL_MIN_CONNECTIONS`       | `2`                           |
/// | `TASKMILL_MAX_CONNECTIONS`       | `10`                          |
/// | `TASKMILL_CONNECTION_TIMEOUT_MS` | `30000`                       |
/// | `TASKMILL_BUSY_TIMEOUT_MS`       | `5000`                        |
/// | `TASKMILL_SCHEMA_VERSION`        | `1`                           |
/// | `TASKMILL_CLI_COMMAND`           | `claude`                      |
/// | `TASKMILL_MAX_INSTANCES`         | `10`                          |
/// | `TASKMILL_USE_ROOMODES`          | `false` (accepted, inert)     |
/// | `TASKMILL_WATCH_ROOMODES`        | `false` (accepted, inert)     |

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use taskmill_engine::supervisor::SupervisorConfig;
use taskmill_shared::db::pool::DatabaseConfig;

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Verbose server logs to stderr
    pub debug: bool,

    /// Supervisor heartbeat cadence
    pub heartbeat_interval_ms: u64,

    /// Default per-task timeout if not overridden
    pub execution_timeout_ms: u64,

    /// Spawn-retry cap
    pub max_retries: u32,

    /// Delay between spawn retries
    pub retry_delay_ms: u64,

    /// Embedded store file path
    pub db_path: PathBuf,

    /// Pool lower bound
    pub min_connections: u32,

    /// Pool upper bound
    pub max_connections: u32,

    /// Acquire wait before failing
    pub connection_timeout_ms: u64,

    /// Store busy retry window
    pub busy_timeout_ms: u64,

    /// Target schema version to migrate up to
    pub schema_version: i64,

    /// Assistant CLI command, whitespace-separated argv
    pub cli_command: String,

    /// Concurrent child-process cap
    pub max_instances: usize,

    /// `.roomodes` integration toggles. Accepted for compatibility; the
    /// integration itself is out of scope.
    pub use_roomodes: bool,
    pub watch_roomodes: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env if present (for development).
        dotenvy::dotenv().ok();

        let default_db_path = env::var("HOME")
            .map(|home| PathBuf::from(home).join(".taskmill").join("taskmill.db"))
            .unwrap_or_else(|_| PathBuf::from("taskmill.db"));

        let db_path = env::var("TASKMILL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(default_db_path);

        let config = Config {
            debug: env_bool("TASKMILL_DEBUG"),
            heartbeat_interval_ms: env_parse("TASKMILL_HEARTBEAT_INTERVAL_MS", 15_000)?,
            execution_timeout_ms: env_parse("TASKMILL_EXECUTION_TIMEOUT_MS", 1_800_000)?,
            max_retries: env_parse("TASKMILL_MAX_RETRIES", 3)?,
            retry_delay_ms: env_parse("TASKMILL_RETRY_DELAY_MS", 1_000)?,
            db_path,
            min_connections: env_parse("TASKMILL_MIN_CONNECTIONS", 2)?,
            max_connections: env_parse("TASKMILL_MAX_CONNECTIONS", 10)?,
            connection_timeout_ms: env_parse("TASKMILL_CONNECTION_TIMEOUT_MS", 30_000)?,
            busy_timeout_ms: env_parse("TASKMILL_BUSY_TIMEOUT_MS", 5_000)?,
            schema_version: env_parse("TASKMILL_SCHEMA_VERSION", 1)?,
            cli_command: env::var("TASKMILL_CLI_COMMAND").unwrap_or_else(|_| "claude".into()),
            max_instances: env_parse("TASKMILL_MAX_INSTANCES", 10)?,
            use_roomodes: env_bool("TASKMILL_USE_ROOMODES"),
            watch_roomodes: env_bool("TASKMILL_WATCH_ROOMODES"),
        };

        if config.min_connections > config.max_connections {
            anyhow::bail!(
                "TASKMILL_MIN_CONNECTIONS ({}) exceeds TASKMILL_MAX_CONNECTIONS ({})",
                config.min_connections,
                config.max_connections
            );
        }
        if config.execution_timeout_ms == 0 {
            anyhow::bail!("TASKMILL_EXECUTION_TIMEOUT_MS must be positive");
        }

        Ok(config)
    }

    /// The store configuration slice.
    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            path: self.db_path.clone(),
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            connection_timeout_ms: self.connection_timeout_ms,
            busy_timeout_ms: self.busy_timeout_ms,
            ..DatabaseConfig::default()
        }
    }

    /// The supervisor configuration slice.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            execution_timeout_ms: self.execution_timeout_ms,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            max_instances: self.max_instances,
            ..SupervisorConfig::default()
        }
    }

    /// Assistant argv: the command string split on whitespace.
    pub fn cli_argv(&self) -> Vec<String> {
        self.cli_command
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}
