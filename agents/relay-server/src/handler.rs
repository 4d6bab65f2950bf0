use std::sync::Arc;

use ethers::types::{Address, Bytes, U256};
use tracing::{debug, info, instrument, warn};

use relay_base::CoreMetrics;
use relay_core::{
    abi::encode_relay_call, ChainCommunicationError, PingResponse, RelayChain,
    RelayTransactionRequest,
};

use crate::key_manager::SignerRole;
use crate::transaction_manager::{TransactionManager, TransactionManagerError, TxParams};

/// The worker that signs `relayCall` transactions
const RELAY_WORKER: SignerRole = SignerRole::Worker(0);

/// Economics and limits the relay advertises and enforces
#[derive(Debug, Clone, Default)]
pub struct RelayServerConfig {
    /// Flat fee required per relayed call
    pub base_relay_fee: U256,
    /// Percentage fee required on top of the gas cost
    pub pct_relay_fee: U256,
    /// Markup over the network gas price, in percent
    pub gas_price_factor_percent: u64,
    /// Floor of the advertised minimum gas price
    pub min_gas_price: U256,
    /// Largest paymaster acceptance budget the relay risks
    pub max_acceptance_budget: U256,
    /// Gas added to the request's own gas for the hub's bookkeeping
    pub relay_call_gas_overhead: U256,
}

/// Why a relay request was refused
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// A key the server needs is not configured
    #[error("No key configured for {0}")]
    MissingKey(SignerRole),
    /// The relay is not accepting requests
    #[error("Relay is not ready")]
    NotReady,
    /// The request names another hub
    #[error("Wrong hub address: relay uses {expected:?}, request has {actual:?}")]
    WrongHub {
        /// This relay's hub
        expected: Address,
        /// Hub in the request
        actual: Address,
    },
    /// The request names another worker
    #[error("Wrong worker address: {0:?}")]
    WrongWorker(Address),
    /// The request's gas price is below the advertised minimum
    #[error("Unacceptable gas price: {gas_price}, minimum is {min_gas_price}")]
    GasPriceTooLow {
        /// Requested gas price
        gas_price: U256,
        /// Current minimum
        min_gas_price: U256,
    },
    /// The request pays less than the configured fees
    #[error("Unacceptable fees: pct {pct_relay_fee}, base {base_relay_fee}")]
    FeesTooLow {
        /// Requested percentage fee
        pct_relay_fee: U256,
        /// Requested flat fee
        base_relay_fee: U256,
    },
    /// The outer transaction would not fit in a block
    #[error("Gas limit {gas_limit} exceeds the block gas limit {block_gas_limit}")]
    GasLimitTooHigh {
        /// Requested gas plus overhead
        gas_limit: U256,
        /// Gas limit of the latest block
        block_gas_limit: U256,
    },
    /// The local `relayCall` dry run failed
    #[error("Paymaster rejected in local view call: {0}")]
    DryRunRejected(String),
    /// The worker's next nonce is above what the client accepts
    #[error("Relay worker nonce {nonce} is above the client's maximum {max_nonce}")]
    NonceAboveMax {
        /// Nonce that would have been used
        nonce: u64,
        /// Client's maximum
        max_nonce: u64,
    },
    /// Chain communication failed
    #[error(transparent)]
    Chain(#[from] ChainCommunicationError),
    /// The transaction could not be signed, stored or broadcast
    #[error(transparent)]
    Transaction(TransactionManagerError),
}

impl From<TransactionManagerError> for RelayServerError {
    fn from(err: TransactionManagerError) -> Self {
        match err {
            TransactionManagerError::NonceAboveMax { nonce, max_nonce } => {
                Self::NonceAboveMax { nonce, max_nonce }
            }
            err => Self::Transaction(err),
        }
    }
}

impl RelayServerError {
    /// The request itself is at fault, as opposed to the relay or the chain
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            Self::MissingKey(_) | Self::Chain(_) | Self::Transaction(_)
        )
    }
}

/// Answers pings and turns valid relay requests into signed `relayCall`
/// transactions of the relay worker.
#[derive(Debug)]
pub struct RelayServer {
    chain: Arc<dyn RelayChain>,
    tx_manager: Arc<TransactionManager>,
    config: RelayServerConfig,
    manager_address: Address,
    worker_address: Address,
    metrics: Arc<CoreMetrics>,
}

impl RelayServer {
    /// Create the server; the transaction manager must hold the manager and
    /// worker keys.
    pub fn new(
        chain: Arc<dyn RelayChain>,
        tx_manager: Arc<TransactionManager>,
        config: RelayServerConfig,
        metrics: Arc<CoreMetrics>,
    ) -> Result<Self, RelayServerError> {
        let address = |role| {
            tx_manager
                .signer_address(role)
                .ok_or(RelayServerError::MissingKey(role))
        };
        let manager_address = address(SignerRole::Manager)?;
        let worker_address = address(RELAY_WORKER)?;
        Ok(Self {
            chain,
            tx_manager,
            config,
            manager_address,
            worker_address,
            metrics,
        })
    }

    /// Address of the worker that signs relayed transactions
    pub fn worker_address(&self) -> Address {
        self.worker_address
    }

    /// Lowest gas price currently accepted: the network price with the
    /// configured markup, never below the configured floor.
    pub async fn min_gas_price(&self) -> Result<U256, RelayServerError> {
        let network = self.chain.get_gas_price().await?;
        let marked_up = network
            .saturating_mul(U256::from(100 + self.config.gas_price_factor_percent))
            / 100;
        Ok(marked_up.max(self.config.min_gas_price))
    }

    /// Health check. The paymaster is only a hint and does not change the
    /// answer.
    pub async fn ping(
        &self,
        paymaster: Option<Address>,
    ) -> Result<PingResponse, RelayServerError> {
        debug!(?paymaster, "Ping");
        Ok(PingResponse {
            relay_worker_address: self.worker_address,
            relay_manager_address: self.manager_address,
            relay_hub_address: self.chain.relay_hub_address(),
            min_gas_price: self.min_gas_price().await?,
            max_acceptance_budget: self.config.max_acceptance_budget,
            ready: !self.tx_manager.is_halted(RELAY_WORKER).await,
            version: env!("CARGO_PKG_VERSION").into(),
        })
    }

    /// Validate a relay request, dry run it, then sign, store and broadcast
    /// the `relayCall` transaction. Returns the raw signed transaction.
    #[instrument(skip_all, fields(from = ?request.relay_request.request.from), err)]
    pub async fn create_relay_transaction(
        &self,
        request: RelayTransactionRequest,
    ) -> Result<Bytes, RelayServerError> {
        let result = self.relay(request).await;
        let outcome = match &result {
            Ok(_) => "accepted",
            Err(err) if err.is_rejection() => "rejected",
            Err(_) => "failed",
        };
        self.metrics
            .relay_requests()
            .with_label_values(&[outcome])
            .inc();
        result
    }

    async fn relay(&self, request: RelayTransactionRequest) -> Result<Bytes, RelayServerError> {
        if self.tx_manager.is_halted(RELAY_WORKER).await {
            return Err(RelayServerError::NotReady);
        }
        let gas_limit = self.validate(&request).await?;

        let relay_data = &request.relay_request.relay_data;
        let calldata = encode_relay_call(
            self.config.max_acceptance_budget,
            &request.relay_request,
            &request.metadata.signature,
            &request.metadata.approval_data,
            gas_limit,
        );
        let simulation = self
            .chain
            .simulate_relay_call(
                self.worker_address,
                calldata.clone(),
                relay_data.gas_price,
                gas_limit,
            )
            .await?;
        if !simulation.is_success() {
            let reason = simulation
                .revert_reason()
                .unwrap_or_else(|| "no revert reason".to_owned());
            warn!(%reason, "Relay request failed the local dry run");
            return Err(RelayServerError::DryRunRejected(reason));
        }

        let sent = self
            .tx_manager
            .send_transaction(
                RELAY_WORKER,
                TxParams {
                    to: self.chain.relay_hub_address(),
                    data: calldata,
                    value: U256::zero(),
                    gas_limit,
                    gas_price: relay_data.gas_price,
                    max_nonce: Some(request.metadata.relay_max_nonce),
                },
            )
            .await?;
        info!(nonce = sent.nonce, tx_id = ?sent.tx_id, "Relayed transaction");
        Ok(sent.raw_tx)
    }

    /// Returns the gas limit of the outer transaction
    async fn validate(&self, request: &RelayTransactionRequest) -> Result<U256, RelayServerError> {
        let hub = self.chain.relay_hub_address();
        if request.metadata.relay_hub_address != hub {
            return Err(RelayServerError::WrongHub {
                expected: hub,
                actual: request.metadata.relay_hub_address,
            });
        }

        let relay_data = &request.relay_request.relay_data;
        if relay_data.relay_worker != self.worker_address {
            return Err(RelayServerError::WrongWorker(relay_data.relay_worker));
        }

        let min_gas_price = self.min_gas_price().await?;
        if relay_data.gas_price < min_gas_price {
            return Err(RelayServerError::GasPriceTooLow {
                gas_price: relay_data.gas_price,
                min_gas_price,
            });
        }

        if relay_data.pct_relay_fee < self.config.pct_relay_fee
            || relay_data.base_relay_fee < self.config.base_relay_fee
        {
            return Err(RelayServerError::FeesTooLow {
                pct_relay_fee: relay_data.pct_relay_fee,
                base_relay_fee: relay_data.base_relay_fee,
            });
        }

        let gas_limit = request
            .relay_request
            .request
            .gas
            .saturating_add(self.config.relay_call_gas_overhead);
        let block_gas_limit = self.chain.get_block_gas_limit().await?;
        if gas_limit > block_gas_limit {
            return Err(RelayServerError::GasLimitTooHigh {
                gas_limit,
                block_gas_limit,
            });
        }
        Ok(gas_limit)
    }
}

#[cfg(test)]
pub(crate) mod tests;
