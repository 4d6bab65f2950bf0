//! Client side of the relay pipeline: discovers and ranks relays from hub
//! events, pings them for availability, submits signed relay requests and
//! validates what comes back before trusting it.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub use client::*;
pub use config::*;
pub use error::*;
pub use http::*;
pub use known_relays::*;
pub use selector::*;
pub use signer::*;
pub use validator::*;

mod client;
mod config;
mod error;
mod http;
mod known_relays;
mod selector;
mod signer;
mod validator;
