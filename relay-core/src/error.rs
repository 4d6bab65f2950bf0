use std::error::Error as StdError;

use ethers::providers::ProviderError;

/// The result of interacting with a chain.
pub type ChainResult<T> = Result<T, ChainCommunicationError>;

/// ChainCommunicationError contains errors returned when attempting to
/// call a chain or dispatch a transaction
#[derive(Debug, thiserror::Error)]
pub enum ChainCommunicationError {
    /// The node refused an event query because the range holds too many
    /// results. Callers are expected to split the range and retry.
    #[error("Event query returned too many results: {0}")]
    TooManyResults(String),
    /// Provider Error
    #[error("{0}")]
    ProviderError(#[from] ProviderError),
    /// The chain returned data that could not be decoded
    #[error("Failed to decode chain response: {0}")]
    DecodingError(String),
    /// Any other error
    #[error("{0}")]
    CustomError(String),
    /// Any other error with a source
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl ChainCommunicationError {
    /// Create a chain communication error from any other string
    pub fn from_other_str(err: &str) -> Self {
        Self::CustomError(err.to_owned())
    }

    /// Returns true if the node rejected an event query for its size
    pub fn is_too_many_results(&self) -> bool {
        matches!(self, Self::TooManyResults(_))
    }
}

impl From<ethers::abi::Error> for ChainCommunicationError {
    fn from(err: ethers::abi::Error) -> Self {
        Self::DecodingError(err.to_string())
    }
}
