use ethers::types::{Address, Bytes};
use serde::{Deserialize, Serialize};

use crate::RelayRequest;

/// Data sent alongside a relay request that is not covered by the sender's
/// signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetadata {
    /// The sender's EIP-712 signature over the request
    pub signature: Bytes,
    /// Paymaster approval data
    pub approval_data: Bytes,
    /// Hub the client expects the relay to call
    pub relay_hub_address: Address,
    /// Highest worker nonce the client will accept in the returned transaction
    pub relay_max_nonce: u64,
}

/// Body of a submit-relay-request call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayTransactionRequest {
    /// The signed request
    pub relay_request: RelayRequest,
    /// Unsigned metadata
    pub metadata: RelayMetadata,
}

/// Answer of a submit-relay-request call: either the raw signed transaction
/// or a structured rejection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayTransactionResponse {
    /// RLP encoded signed transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_tx: Option<Bytes>,
    /// Why the relay refused the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelayTransactionResponse {
    /// A successful answer
    pub fn signed(raw_tx: Bytes) -> Self {
        Self {
            signed_tx: Some(raw_tx),
            error: None,
        }
    }

    /// A rejection
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            signed_tx: None,
            error: Some(reason.into()),
        }
    }
}
