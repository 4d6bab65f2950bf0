pub use chain::*;

mod chain;
