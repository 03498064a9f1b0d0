//! # Taskmill Server Library
//!
//! The front-end of the Taskmill system: configuration, application
//! state, the stdio NDJSON transport and the tool surface.
//!
//! ## Modules
//!
//! - `config`: environment-driven immutable configuration
//! - `app`: shared application state
//! - `transport`: line-delimited JSON framing over stdio
//! - `tools`: `health`, `convert_task_markdown`, `claude_code`
//! - `error`: transport error bodies and code mapping

pub mod app;
pub mod config;
pub mod error;
pub mod tools;
pub mod transport;
