use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// A relay discovered from its on-chain registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCandidate {
    /// Public URL of the relay server
    pub relay_url: String,
    /// Address of the relay manager that registered the relay
    pub relay_manager: Address,
    /// Percentage fee charged on top of the gas cost
    pub pct_relay_fee: U256,
    /// Flat fee charged per relayed call
    pub base_relay_fee: U256,
    /// Block of the registration event
    pub registered_at_block: u64,
    /// Position of the registration transaction within its block
    pub registered_at_tx_index: u64,
}

/// A relay the client knows about, before it has been pinged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownRelay {
    /// A statically configured relay; its manager is only learned from a ping
    Preferred {
        /// Public URL of the relay server
        relay_url: String,
    },
    /// A relay derived from hub events
    Registered(RelayCandidate),
}

impl KnownRelay {
    /// The URL to contact the relay at
    pub fn relay_url(&self) -> &str {
        match self {
            KnownRelay::Preferred { relay_url } => relay_url,
            KnownRelay::Registered(candidate) => &candidate.relay_url,
        }
    }

    /// The on-chain registration, if the relay came from events
    pub fn registration(&self) -> Option<&RelayCandidate> {
        match self {
            KnownRelay::Preferred { .. } => None,
            KnownRelay::Registered(candidate) => Some(candidate),
        }
    }
}

/// An observed failure of a relay. Failures only lower a relay's score and
/// expire after the configured grace period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFailureRecord {
    /// URL of the failing relay
    pub relay_url: String,
    /// Manager of the failing relay, if known
    pub relay_manager: Option<Address>,
    /// When the failure was observed, in milliseconds since the unix epoch
    pub timestamp_millis: u64,
}

/// The health-check answer of a relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    /// Worker that will sign the outer transaction
    pub relay_worker_address: Address,
    /// Manager the relay is registered under
    pub relay_manager_address: Address,
    /// Hub the relay submits to
    pub relay_hub_address: Address,
    /// Lowest gas price the relay accepts
    pub min_gas_price: U256,
    /// Largest paymaster acceptance budget the relay will risk
    pub max_acceptance_budget: U256,
    /// Whether the relay currently accepts requests
    pub ready: bool,
    /// Server version
    #[serde(default)]
    pub version: String,
}

/// What the user wants to relay, before relay economics are attached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDetails {
    /// Sender of the meta-transaction
    pub from: Address,
    /// Recipient contract
    pub to: Address,
    /// Calldata
    pub data: Bytes,
    /// Value forwarded with the call
    #[serde(default)]
    pub value: U256,
    /// Gas limit of the inner call; estimated when absent
    #[serde(default)]
    pub gas: Option<U256>,
    /// Forced gas price; derived from the network price when absent
    #[serde(default)]
    pub gas_price: Option<U256>,
    /// Forwarder override for this transaction
    #[serde(default)]
    pub forwarder: Option<Address>,
    /// Paymaster override for this transaction
    #[serde(default)]
    pub paymaster: Option<Address>,
    /// Client id override for this transaction
    #[serde(default)]
    pub client_id: Option<U256>,
}
