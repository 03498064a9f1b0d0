/// Application state
///
/// One store, one supervisor, one scheduler, wired together at startup
/// and cloned into every tool handler. Uses `Arc` internally so cloning
/// is cheap.

use crate::config::Config;
use std::sync::Arc;
use std::time::Instant;
use taskmill_engine::runner::{CliRunner, TaskRunner};
use taskmill_engine::scheduler::Scheduler;
use taskmill_engine::supervisor::Supervisor;
use taskmill_shared::db::store::Store;
use taskmill_shared::events::EventBus;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub bus: EventBus,
    pub supervisor: Arc<Supervisor>,
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<Config>,

    /// Server start, for `health.uptimeMs`
    pub started_at: Instant,
}

impl AppState {
    /// Wires the state with the production CLI runner.
    pub fn new(store: Store, config: Config) -> Self {
        let runner: Arc<dyn TaskRunner> = Arc::new(CliRunner::new(
            config.cli_argv(),
            std::time::Duration::from_millis(1_000),
        ));
        Self::with_runner(store, config, runner)
    }

    /// Wires the state with an explicit runner (tests use the mock).
    pub fn with_runner(store: Store, config: Config, runner: Arc<dyn TaskRunner>) -> Self {
        let bus = EventBus::default();
        let supervisor = Arc::new(Supervisor::new(
            store.pool().clone(),
            bus.clone(),
            runner,
            config.supervisor_config(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.pool().clone(),
            bus.clone(),
            supervisor.clone(),
        ));

        AppState {
            store,
            bus,
            supervisor,
            scheduler,
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}
