//! # Taskmill Shared Library
//!
//! Shared types and the data layer used across the Taskmill engine and
//! server: the embedded store, persisted models, the in-process event
//! bus and the common error type.
//!
//! ## Module Organization
//!
//! - `db`: embedded store (pool, migrations, `Store` handle)
//! - `models`: persisted entities and their query surface
//! - `events`: broadcast bus for live task-log frames
//! - `error`: typed error kinds mapping onto transport codes

pub mod db;
pub mod error;
pub mod events;
pub mod models;

/// Current version of the Taskmill shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
