//! `FieldHub` Core Library
//!
//! Shared functionality for `FieldHub` components:
//! - Configuration resolution and defaults
//! - Database pool helpers and the `define_database!` macro
//! - Lightweight process metrics counters
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use metrics::Metrics;
