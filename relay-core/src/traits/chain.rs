use std::fmt::Debug;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};

use crate::{
    abi::decode_revert_reason, ChainResult, RelayEventName, RelayHubEvent, TransactionDetails,
};

/// Which transaction count to read for an account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTag {
    /// Transactions included in the latest block
    Latest,
    /// Including transactions still in the mempool
    Pending,
}

/// The outcome of a local dry run of `relayCall`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelayCallSimulation {
    /// Whether the paymaster accepted the request
    pub paymaster_accepted: bool,
    /// Whether the call itself reverted
    pub reverted: bool,
    /// Return value of `relayCall`, or the revert data
    pub return_value: Bytes,
}

impl RelayCallSimulation {
    /// The call went through and the paymaster accepted it
    pub fn is_success(&self) -> bool {
        self.paymaster_accepted && !self.reverted
    }

    /// Decoded revert reason of the call or of the paymaster rejection
    pub fn revert_reason(&self) -> Option<String> {
        decode_revert_reason(&self.return_value)
    }
}

/// The chain as seen by the relay pipeline: hub and stake manager events,
/// the `relayCall` dry run, forwarder and recipient reads, and broadcasting.
#[async_trait]
pub trait RelayChain: Send + Sync + Debug {
    /// Address of the relay hub
    fn relay_hub_address(&self) -> Address;

    /// Id of the chain, used as EIP-712 domain
    fn chain_id(&self) -> u64;

    /// Latest block number
    async fn get_block_number(&self) -> ChainResult<u64>;

    /// Fetch hub events of the given names, optionally restricted to a set
    /// of relay managers, in `[from_block, to_block]`. Returns
    /// `ChainCommunicationError::TooManyResults` when the node refuses the
    /// range for its size.
    async fn get_past_events(
        &self,
        names: &[RelayEventName],
        relay_managers: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<RelayHubEvent>>;

    /// Dry run `relayCall` calldata from the relay worker against the hub.
    async fn simulate_relay_call(
        &self,
        relay_worker: Address,
        calldata: Bytes,
        gas_price: U256,
        gas_limit: U256,
    ) -> ChainResult<RelayCallSimulation>;

    /// The sender's nonce in the forwarder
    async fn get_sender_nonce(&self, forwarder: Address, sender: Address) -> ChainResult<U256>;

    /// The forwarder declared by a recipient, if it exposes one
    async fn get_trusted_forwarder(&self, recipient: Address) -> ChainResult<Option<Address>>;

    /// Whether a recipient trusts the given forwarder
    async fn is_trusted_forwarder(&self, recipient: Address, forwarder: Address)
        -> ChainResult<bool>;

    /// Whether there is code at the address
    async fn is_contract_deployed(&self, address: Address) -> ChainResult<bool>;

    /// Gas limit of the latest block
    async fn get_block_gas_limit(&self) -> ChainResult<U256>;

    /// Current network gas price
    async fn get_gas_price(&self) -> ChainResult<U256>;

    /// Estimate the gas of the inner call of a meta-transaction
    async fn estimate_gas(&self, details: &TransactionDetails) -> ChainResult<U256>;

    /// Transaction count of an account
    async fn get_transaction_count(&self, address: Address, tag: NonceTag) -> ChainResult<U256>;

    /// Broadcast a raw signed transaction, returning its hash
    async fn broadcast_transaction(&self, raw_tx: Bytes) -> ChainResult<H256>;
}
