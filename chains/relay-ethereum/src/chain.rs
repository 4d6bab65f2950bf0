use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use derive_new::new;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::{Middleware, MiddlewareError};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, TransactionRequest, H256,
    U256,
};
use tracing::{debug, instrument};

use relay_core::{
    abi::{decode_relay_call_output, encode_call},
    u256_to_u64, ChainCommunicationError, ChainResult, NonceTag, RelayCallSimulation, RelayChain,
    RelayEventName, RelayHubEvent, TransactionDetails,
};

use crate::{parse_relay_event, relay_events_filter, TOO_MANY_RESULTS_MESSAGE};

/// The relay hub and stake manager of an EVM chain, reached through an
/// ethers middleware.
#[derive(Debug, new)]
pub struct EthereumRelayChain<M> {
    provider: Arc<M>,
    relay_hub: Address,
    stake_manager: Address,
    chain_id: u64,
}

fn middleware_error<E: MiddlewareError + 'static>(err: E) -> ChainCommunicationError {
    let message = err.to_string();
    if message.contains(TOO_MANY_RESULTS_MESSAGE) {
        ChainCommunicationError::TooManyResults(message)
    } else {
        ChainCommunicationError::Other(Box::new(err))
    }
}

impl<M> EthereumRelayChain<M>
where
    M: Middleware + 'static,
{
    /// Create a chain for the given hub and stake manager, reading the chain
    /// id from the node.
    pub async fn connect(
        provider: Arc<M>,
        relay_hub: Address,
        stake_manager: Address,
    ) -> ChainResult<Self> {
        let chain_id = u256_to_u64(provider.get_chainid().await.map_err(middleware_error)?)?;
        Ok(Self::new(provider, relay_hub, stake_manager, chain_id))
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, M::Error> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider.call(&tx, None).await
    }

    /// Call a view function. A revert, or output that does not decode as
    /// `output`, is reported as `None`.
    async fn view(
        &self,
        to: Address,
        name: &str,
        params: &[ParamType],
        args: &[Token],
        output: ParamType,
    ) -> ChainResult<Option<Token>> {
        match self.call(to, encode_call(name, params, args)).await {
            Ok(bytes) => Ok(abi::decode(&[output], &bytes)
                .ok()
                .and_then(|mut tokens| tokens.pop())),
            Err(err) if err.as_error_response().is_some() => {
                debug!(?to, name, error = %err, "View call reverted");
                Ok(None)
            }
            Err(err) => Err(middleware_error(err)),
        }
    }
}

#[async_trait]
impl<M> RelayChain for EthereumRelayChain<M>
where
    M: Middleware + 'static,
{
    fn relay_hub_address(&self) -> Address {
        self.relay_hub
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_block_number(&self) -> ChainResult<u64> {
        Ok(self
            .provider
            .get_block_number()
            .await
            .map_err(middleware_error)?
            .as_u64())
    }

    #[instrument(skip(self, relay_managers), fields(managers = relay_managers.len()), err)]
    async fn get_past_events(
        &self,
        names: &[RelayEventName],
        relay_managers: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<RelayHubEvent>> {
        let filter = relay_events_filter(
            vec![self.relay_hub, self.stake_manager],
            names,
            relay_managers,
            from_block,
            to_block,
        );
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(middleware_error)?;
        Ok(logs.iter().filter_map(parse_relay_event).collect())
    }

    async fn simulate_relay_call(
        &self,
        relay_worker: Address,
        calldata: Bytes,
        gas_price: U256,
        gas_limit: U256,
    ) -> ChainResult<RelayCallSimulation> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(relay_worker)
            .to(self.relay_hub)
            .data(calldata)
            .gas(gas_limit)
            .gas_price(gas_price)
            .into();
        match self.provider.call(&tx, None).await {
            Ok(output) => {
                let (paymaster_accepted, return_value) = decode_relay_call_output(&output)?;
                Ok(RelayCallSimulation {
                    paymaster_accepted,
                    reverted: false,
                    return_value,
                })
            }
            Err(err) => match err.as_error_response().and_then(|e| e.as_revert_data()) {
                Some(revert_data) => Ok(RelayCallSimulation {
                    paymaster_accepted: false,
                    reverted: true,
                    return_value: revert_data,
                }),
                None => Err(middleware_error(err)),
            },
        }
    }

    async fn get_sender_nonce(&self, forwarder: Address, sender: Address) -> ChainResult<U256> {
        let nonce = self
            .view(
                forwarder,
                "getNonce",
                &[ParamType::Address],
                &[Token::Address(sender)],
                ParamType::Uint(256),
            )
            .await?;
        match nonce {
            Some(Token::Uint(nonce)) => Ok(nonce),
            _ => Err(ChainCommunicationError::DecodingError(format!(
                "forwarder {forwarder:?} returned no nonce for {sender:?}"
            ))),
        }
    }

    async fn get_trusted_forwarder(&self, recipient: Address) -> ChainResult<Option<Address>> {
        let forwarder = self
            .view(recipient, "getTrustedForwarder", &[], &[], ParamType::Address)
            .await?;
        Ok(match forwarder {
            Some(Token::Address(forwarder)) if !forwarder.is_zero() => Some(forwarder),
            _ => None,
        })
    }

    async fn is_trusted_forwarder(
        &self,
        recipient: Address,
        forwarder: Address,
    ) -> ChainResult<bool> {
        let trusted = self
            .view(
                recipient,
                "isTrustedForwarder",
                &[ParamType::Address],
                &[Token::Address(forwarder)],
                ParamType::Bool,
            )
            .await?;
        Ok(matches!(trusted, Some(Token::Bool(true))))
    }

    async fn is_contract_deployed(&self, address: Address) -> ChainResult<bool> {
        let code = self
            .provider
            .get_code(address, None)
            .await
            .map_err(middleware_error)?;
        Ok(!code.is_empty())
    }

    async fn get_block_gas_limit(&self) -> ChainResult<U256> {
        self.provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(middleware_error)?
            .map(|block| block.gas_limit)
            .ok_or_else(|| ChainCommunicationError::from_other_str("latest block not found"))
    }

    async fn get_gas_price(&self) -> ChainResult<U256> {
        self.provider
            .get_gas_price()
            .await
            .map_err(middleware_error)
    }

    async fn estimate_gas(&self, details: &TransactionDetails) -> ChainResult<U256> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(details.from)
            .to(details.to)
            .data(details.data.clone())
            .value(details.value)
            .into();
        self.provider
            .estimate_gas(&tx, None)
            .await
            .map_err(middleware_error)
    }

    async fn get_transaction_count(&self, address: Address, tag: NonceTag) -> ChainResult<U256> {
        let block = match tag {
            NonceTag::Latest => BlockNumber::Latest,
            NonceTag::Pending => BlockNumber::Pending,
        };
        self.provider
            .get_transaction_count(address, Some(block.into()))
            .await
            .map_err(middleware_error)
    }

    async fn broadcast_transaction(&self, raw_tx: Bytes) -> ChainResult<H256> {
        let pending = self
            .provider
            .send_raw_transaction(raw_tx)
            .await
            .map_err(middleware_error)?;
        Ok(pending.tx_hash())
    }
}
