/// Database models for Taskmill
///
/// This module contains all persisted entities and their CRUD/query
/// operations. Every write goes through a guarded statement or an
/// explicit transaction; every read normalizes stored JSON blobs
/// (metadata, metrics, config) back into the typed entity shape.
///
/// # Models
///
/// - `task`: execution-graph nodes and their state machine
/// - `subtask`: per-child graph shape (ordinals, dependencies, mode)
/// - `instance`: supervised child-process slots with rolling metrics
/// - `task_log`: append-only event log
/// - `task_result`: one terminal result per task
/// - `telemetry`: raw instance samples and bucketed time-series rollups

pub mod instance;
pub mod subtask;
pub mod task;
pub mod task_log;
pub mod task_result;
pub mod telemetry;
