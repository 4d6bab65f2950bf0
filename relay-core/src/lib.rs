//! This crate contains the core primitives of the relay pipeline: the relay
//! request and its economics, relay candidates and failure records, hub event
//! types, the wire types exchanged with relay servers, and the `RelayChain`
//! trait through which both clients and servers talk to the chain.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub use error::*;
pub use traits::*;
pub use types::*;
pub use utils::*;

/// `relayCall` ABI encoding and revert reason decoding
pub mod abi;
mod error;
mod traits;
mod types;
mod utils;

/// Mocks of the core traits for use in tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use ethers::types::{Address, Bytes, Signature, H256, U256};
