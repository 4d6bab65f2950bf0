use ethers::types::{Address, U256};

use relay_core::ChainCommunicationError;

/// Errors of the relay client. Most of them are attributed to one relay and
/// collected in a [`crate::RelayingResult`]; the rest abort the operation.
#[derive(Debug, thiserror::Error)]
pub enum RelayClientError {
    /// Chain Error
    #[error(transparent)]
    Chain(#[from] ChainCommunicationError),
    /// The relay did not answer in time
    #[error("Request to relay {url} timed out")]
    Timeout {
        /// Relay URL
        url: String,
    },
    /// The relay could not be reached
    #[error("Failed to reach relay {url}: {message}")]
    Transport {
        /// Relay URL
        url: String,
        /// Transport error
        message: String,
    },
    /// The relay answered with something that is not a valid response
    #[error("Invalid response from relay {url}: {message}")]
    InvalidResponse {
        /// Relay URL
        url: String,
        /// What was wrong
        message: String,
    },
    /// The relay refused the request
    #[error("Relay {url} rejected the request: {reason}")]
    Rejected {
        /// Relay URL
        url: String,
        /// Reason given by the relay
        reason: String,
    },
    /// The relay reported it is not ready
    #[error("Relay {url} is not ready")]
    RelayNotReady {
        /// Relay URL
        url: String,
    },
    /// The relay wants more than the transaction offers
    #[error("Relay {url} requires gas price {min_gas_price}, transaction offers {gas_price}")]
    GasPriceTooLow {
        /// Relay URL
        url: String,
        /// Price required by the relay
        min_gas_price: U256,
        /// Price of the transaction
        gas_price: U256,
    },
    /// The relay serves another hub
    #[error("Relay {url} serves hub {relay_hub:?}")]
    WrongHub {
        /// Relay URL
        url: String,
        /// Hub advertised by the relay
        relay_hub: Address,
    },
    /// The local dry run of `relayCall` reverted
    #[error("Local view call to 'relayCall' reverted: {0}")]
    LocalViewCallReverted(String),
    /// The paymaster rejected the request in the local dry run
    #[error("Paymaster rejected in local view call to 'relayCall': {0}")]
    PaymasterRejected(String),
    /// The returned transaction is not the one that was requested
    #[error("Returned transaction did not pass validation")]
    ValidationFailed,
    /// The returned transaction uses a nonce the client did not agree to
    #[error("Relay used nonce {nonce}, above the max relay nonce {max_nonce}")]
    NonceAboveMax {
        /// Nonce of the returned transaction
        nonce: U256,
        /// Highest nonce the client accepts
        max_nonce: u64,
    },
    /// No forwarder is configured and the recipient declares none
    #[error("No forwarder address configured and no getTrustedForwarder in target contract")]
    NoForwarder,
    /// The configured forwarder is not trusted by the recipient
    #[error("The forwarder {forwarder:?} is not trusted by recipient {recipient:?}")]
    UntrustedForwarder {
        /// The configured forwarder
        forwarder: Address,
        /// The recipient
        recipient: Address,
    },
    /// No signing key for the sender
    #[error("No signing key for {0:?}")]
    MissingSigner(Address),
    /// Signing the request failed
    #[error("Failed to sign relay request: {0}")]
    Signing(String),
    /// A paymaster or approval data callback failed
    #[error("Failed to compute {kind} data: {message}")]
    Callback {
        /// Which callback
        kind: &'static str,
        /// Callback error
        message: String,
    },
}

impl RelayClientError {
    /// Whether the failure should count against the relay's score. Timeouts
    /// and failures that are not a structured rejection count; explicit
    /// rejections do not.
    pub fn should_penalize_relay(&self) -> bool {
        matches!(
            self,
            RelayClientError::Timeout { .. }
                | RelayClientError::Transport { .. }
                | RelayClientError::InvalidResponse { .. }
        )
    }

    /// Whether the failure aborts the whole relaying attempt instead of
    /// moving on to the next relay.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayClientError::Chain(_)
                | RelayClientError::MissingSigner(_)
                | RelayClientError::Signing(_)
                | RelayClientError::Callback { .. }
        )
    }
}
