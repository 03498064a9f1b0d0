/// Embedded store: pool, migrations and the `Store` handle
///
/// # Modules
///
/// - `pool`: SQLite connection pool with WAL/synchronous/busy pragmas
/// - `migrations`: versioned forward/backward schema migrations
/// - `store`: the process-wide store handle passed to repositories

pub mod migrations;
pub mod pool;
pub mod store;

pub use pool::{DatabaseConfig, PoolStats};
pub use store::Store;
