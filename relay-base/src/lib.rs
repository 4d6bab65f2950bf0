//! This crate contains the shared plumbing of the relay binaries: the
//! RocksDB key-value store, settings loading, tracing setup, metrics, and
//! the HTTP server.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub use metrics::*;
pub use server::*;

/// Persistent key-value storage
pub mod db;
mod metrics;
mod server;
/// Settings loading and tracing configuration
pub mod settings;
