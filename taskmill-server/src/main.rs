//! # Taskmill Server
//!
//! Task-orchestration server for an external command-line assistant.
//! Exposes `health`, `convert_task_markdown` and `claude_code` over a
//! line-delimited JSON transport on stdio; drives task graphs through
//! the scheduler/supervisor engine; persists everything in an embedded
//! SQLite store.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p taskmill-server
//! ```

use taskmill_engine::telemetry::{TelemetryRollup, DEFAULT_ROLLUP_INTERVAL_MS};
use taskmill_server::app::AppState;
use taskmill_server::config::Config;
use taskmill_server::transport;
use taskmill_shared::db::store::Store;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    // stdout is the transport; all diagnostics go to stderr.
    let default_filter = if config.debug {
        "taskmill=debug"
    } else {
        "taskmill=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        db_path = %config.db_path.display(),
        "Taskmill server starting"
    );

    let store = Store::open(config.database_config(), config.schema_version).await?;
    let state = AppState::new(store, config);

    let rollup = TelemetryRollup::new(state.store.pool().clone());
    let rollup_handle = rollup.spawn_periodic(DEFAULT_ROLLUP_INTERVAL_MS);

    tokio::select! {
        result = transport::serve(state.clone()) => {
            result?;
            tracing::info!("Client disconnected");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    rollup_handle.abort();
    state.supervisor.shutdown().await;
    state.store.close().await;

    tracing::info!("Taskmill server stopped");
    Ok(())
}
