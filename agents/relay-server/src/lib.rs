//! The relay server accepts signed relay requests over HTTP, validates and
//! dry runs them, and turns them into `relayCall` transactions of its worker.
//! Every signed transaction is persisted before it is broadcast and kept
//! moving by a reconciliation loop until its nonce is mined.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use agent::RelayServerAgent;
pub use settings::RelayServerSettings;

mod agent;
/// Validation and signing of relay requests
pub mod handler;
/// Local keys of the relay manager and workers
pub mod key_manager;
/// HTTP routes
pub mod server;
pub mod settings;
/// Nonce assignment, broadcasting and resubmission
pub mod transaction_manager;
/// Durable store of in-flight transactions
pub mod tx_store;
