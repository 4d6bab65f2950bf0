//! An ethers-backed implementation of the `RelayChain` trait for EVM chains.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub use chain::*;
pub use logs::*;

mod chain;
mod logs;
