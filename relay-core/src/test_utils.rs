#![allow(missing_docs)]

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use mockall::mock;

use crate::{
    ChainResult, NonceTag, RelayCallSimulation, RelayChain, RelayEventName, RelayHubEvent,
    TransactionDetails,
};

mock! {
    pub RelayChain {}

    #[async_trait]
    impl RelayChain for RelayChain {
        fn relay_hub_address(&self) -> Address;

        fn chain_id(&self) -> u64;

        async fn get_block_number(&self) -> ChainResult<u64>;

        async fn get_past_events(
            &self,
            names: &[RelayEventName],
            relay_managers: &[Address],
            from_block: u64,
            to_block: u64,
        ) -> ChainResult<Vec<RelayHubEvent>>;

        async fn simulate_relay_call(
            &self,
            relay_worker: Address,
            calldata: Bytes,
            gas_price: U256,
            gas_limit: U256,
        ) -> ChainResult<RelayCallSimulation>;

        async fn get_sender_nonce(&self, forwarder: Address, sender: Address) -> ChainResult<U256>;

        async fn get_trusted_forwarder(&self, recipient: Address) -> ChainResult<Option<Address>>;

        async fn is_trusted_forwarder(
            &self,
            recipient: Address,
            forwarder: Address,
        ) -> ChainResult<bool>;

        async fn is_contract_deployed(&self, address: Address) -> ChainResult<bool>;

        async fn get_block_gas_limit(&self) -> ChainResult<U256>;

        async fn get_gas_price(&self) -> ChainResult<U256>;

        async fn estimate_gas(&self, details: &TransactionDetails) -> ChainResult<U256>;

        async fn get_transaction_count(&self, address: Address, tag: NonceTag) -> ChainResult<U256>;

        async fn broadcast_transaction(&self, raw_tx: Bytes) -> ChainResult<H256>;
    }
}

impl std::fmt::Debug for MockRelayChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockRelayChain")
    }
}
