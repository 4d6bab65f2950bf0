use ethers::types::U256;

use crate::{ChainCommunicationError, ChainResult};

/// Narrow a counter read from the chain, such as a nonce or chain id, to
/// `u64`. Values that do not fit are reported as a decoding error.
pub fn u256_to_u64(value: U256) -> ChainResult<u64> {
    if value.bits() > 64 {
        return Err(ChainCommunicationError::DecodingError(format!(
            "{value} does not fit in 64 bits"
        )));
    }
    Ok(value.low_u64())
}
