use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use relay_base::CoreMetrics;
use relay_core::{
    abi::encode_relay_call, ForwardRequest, NonceTag, RelayChain, RelayData, RelayMetadata,
    RelayRequest, RelayRequestOverrides, RelayTransactionRequest, TransactionDetails,
};

use crate::{
    validate_relay_response, ActiveRelay, DefaultPingFilter, HttpClient, KnownRelaysManager,
    PingFilter, RelayClientConfig, RelayClientError, RelayHttpClient, RelaySelector,
    RequestSigner,
};

#[cfg(test)]
mod tests;

/// Broadcast errors meaning the transaction is already in the mempool or
/// mined.
static BENIGN_BROADCAST_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new("known transaction|already known|nonce too low|correct nonce")
        .expect("valid regex literal")
});

/// Supplies the paymaster data attached to a request before it is signed,
/// and the approval data attached after.
#[async_trait]
pub trait AsyncDataCallback: Send + Sync + Debug {
    /// Data passed to the paymaster, covered by the sender's signature
    async fn paymaster_data(&self, _request: &RelayRequest) -> eyre::Result<Bytes> {
        Ok(Bytes::default())
    }

    /// Paymaster approval data for an already signed request
    async fn approval_data(&self, _request: &RelayRequest) -> eyre::Result<Bytes> {
        Ok(Bytes::default())
    }
}

/// Attaches no data
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyDataCallback;

impl AsyncDataCallback for EmptyDataCallback {}

/// A transaction a relay submitted for us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedTransaction {
    /// The raw signed transaction returned by the relay
    pub raw_tx: Bytes,
    /// Its hash
    pub tx_hash: H256,
    /// The relay that signed it
    pub relay_url: String,
}

/// Outcome of [`RelayClient::relay_transaction`].
#[derive(Debug, Default)]
pub struct RelayingResult {
    /// The relayed transaction, if any relay succeeded
    pub transaction: Option<RelayedTransaction>,
    /// Relays that did not answer their ping or were filtered out
    pub ping_errors: HashMap<String, RelayClientError>,
    /// Relays that answered the ping but failed to relay
    pub relaying_errors: HashMap<String, RelayClientError>,
}

impl RelayingResult {
    /// No relay got as far as being asked to relay
    pub fn is_nothing_reachable(&self) -> bool {
        self.transaction.is_none() && self.relaying_errors.is_empty()
    }
}

/// Relays meta-transactions through third party relay servers.
#[derive(Debug)]
pub struct RelayClient {
    chain: Arc<dyn RelayChain>,
    config: RelayClientConfig,
    known_relays: Arc<KnownRelaysManager>,
    http: Arc<dyn RelayHttpClient>,
    signer: Arc<dyn RequestSigner>,
    data_callback: Arc<dyn AsyncDataCallback>,
    ping_filter: Arc<dyn PingFilter>,
    metrics: Arc<CoreMetrics>,
}

impl RelayClient {
    /// Create a client from its parts
    pub fn new(
        chain: Arc<dyn RelayChain>,
        config: RelayClientConfig,
        known_relays: Arc<KnownRelaysManager>,
        http: Arc<dyn RelayHttpClient>,
        signer: Arc<dyn RequestSigner>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        let ping_filter = Arc::new(DefaultPingFilter::new(chain.relay_hub_address()));
        Self {
            chain,
            config,
            known_relays,
            http,
            signer,
            data_callback: Arc::new(EmptyDataCallback),
            ping_filter,
            metrics,
        }
    }

    /// Create a client with the default relay scoring, HTTP transport and
    /// data callbacks
    pub fn from_config(
        chain: Arc<dyn RelayChain>,
        config: RelayClientConfig,
        signer: Arc<dyn RequestSigner>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        let known_relays = Arc::new(KnownRelaysManager::with_defaults(
            chain.clone(),
            config.clone(),
        ));
        let http = Arc::new(HttpClient::new(config.ping_timeout(), config.relay_timeout()));
        Self::new(chain, config, known_relays, http, signer, metrics)
    }

    /// Replace the paymaster and approval data callbacks
    pub fn with_data_callback(mut self, data_callback: Arc<dyn AsyncDataCallback>) -> Self {
        self.data_callback = data_callback;
        self
    }

    /// Replace the ping filter
    pub fn with_ping_filter(mut self, ping_filter: Arc<dyn PingFilter>) -> Self {
        self.ping_filter = ping_filter;
        self
    }

    /// The known relays and their failures
    pub fn known_relays(&self) -> &Arc<KnownRelaysManager> {
        &self.known_relays
    }

    /// Relay a meta-transaction. Relays are tried in order until one returns
    /// a valid signed transaction, which is then also broadcast by us.
    ///
    /// Returns an error only when relaying cannot proceed at all; failures of
    /// individual relays are collected in the result.
    #[instrument(skip_all, fields(from = ?details.from, to = ?details.to))]
    pub async fn relay_transaction(
        &self,
        details: TransactionDetails,
    ) -> Result<RelayingResult, RelayClientError> {
        self.known_relays.refresh().await?;

        let gas_price = match details.gas_price {
            Some(gas_price) => gas_price,
            None => self.calculate_gas_price().await?,
        };
        let gas = match details.gas {
            Some(gas) => gas,
            None => self.chain.estimate_gas(&details).await?,
        };
        let details = TransactionDetails {
            gas: Some(gas),
            gas_price: Some(gas_price),
            ..details
        };
        let forwarder = self.resolve_forwarder(&details).await?;
        let paymaster = details.paymaster.unwrap_or(self.config.paymaster_address);
        let template = self.request_template(&details, forwarder, paymaster).await?;

        let tiers = self
            .known_relays
            .get_relays_sorted_for_transaction(&details)
            .await;
        let mut selector = RelaySelector::new(
            self.http.clone(),
            self.known_relays.clone(),
            self.ping_filter.clone(),
            tiers,
            gas_price,
            Some(paymaster),
            self.config.slice_size,
        );

        let mut relaying_errors = HashMap::new();
        while let Some(active) = selector.select_next().await {
            let relay_url = active.relay.relay_url.clone();
            match self.attempt_relay(&template, &active).await {
                Ok(transaction) => {
                    self.metrics
                        .relay_requests()
                        .with_label_values(&["relayed"])
                        .inc();
                    return Ok(RelayingResult {
                        transaction: Some(transaction),
                        ping_errors: selector.into_ping_errors(),
                        relaying_errors,
                    });
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(relay_url, %err, "Failed to relay through relay, trying next");
                    relaying_errors.insert(relay_url, err);
                }
            }
        }

        self.metrics
            .relay_requests()
            .with_label_values(&["failed"])
            .inc();
        let result = RelayingResult {
            transaction: None,
            ping_errors: selector.into_ping_errors(),
            relaying_errors,
        };
        warn!(
            ping_errors = result.ping_errors.len(),
            relaying_errors = result.relaying_errors.len(),
            nothing_reachable = result.is_nothing_reachable(),
            "Failed to relay transaction"
        );
        Ok(result)
    }

    /// Network price marked up by the configured factor, at least the
    /// configured minimum
    pub async fn calculate_gas_price(&self) -> Result<U256, RelayClientError> {
        let network_price = self.chain.get_gas_price().await?;
        let marked_up = network_price
            .saturating_mul(U256::from(100 + self.config.gas_price_factor_percent))
            / U256::from(100);
        Ok(marked_up.max(U256::from(self.config.min_gas_price)))
    }

    /// The forwarder to route the request through. An explicit forwarder must
    /// be trusted by the recipient once the recipient is deployed; otherwise
    /// the recipient's declared forwarder is used.
    pub async fn resolve_forwarder(
        &self,
        details: &TransactionDetails,
    ) -> Result<Address, RelayClientError> {
        let recipient = details.to;
        match details.forwarder.or(self.config.forwarder_address) {
            Some(forwarder) => {
                if !self.chain.is_contract_deployed(recipient).await? {
                    warn!(
                        ?recipient,
                        ?forwarder,
                        "Recipient is not deployed, cannot check that it trusts the forwarder"
                    );
                } else if !self.chain.is_trusted_forwarder(recipient, forwarder).await? {
                    return Err(RelayClientError::UntrustedForwarder {
                        forwarder,
                        recipient,
                    });
                }
                Ok(forwarder)
            }
            None => self
                .chain
                .get_trusted_forwarder(recipient)
                .await?
                .ok_or(RelayClientError::NoForwarder),
        }
    }

    /// The request with everything but the relay specific fields filled in
    async fn request_template(
        &self,
        details: &TransactionDetails,
        forwarder: Address,
        paymaster: Address,
    ) -> Result<RelayRequest, RelayClientError> {
        let nonce = self.chain.get_sender_nonce(forwarder, details.from).await?;
        Ok(RelayRequest {
            request: ForwardRequest {
                from: details.from,
                to: details.to,
                value: details.value,
                gas: details.gas.unwrap_or_default(),
                nonce,
                data: details.data.clone(),
            },
            relay_data: RelayData {
                gas_price: details.gas_price.unwrap_or_default(),
                pct_relay_fee: U256::zero(),
                base_relay_fee: U256::zero(),
                relay_worker: Address::zero(),
                paymaster,
                forwarder,
                paymaster_data: Bytes::default(),
                client_id: details
                    .client_id
                    .unwrap_or_else(|| U256::from(self.config.client_id)),
            },
        })
    }

    #[instrument(skip_all, fields(relay_url = %active.relay.relay_url))]
    async fn attempt_relay(
        &self,
        template: &RelayRequest,
        active: &ActiveRelay,
    ) -> Result<RelayedTransaction, RelayClientError> {
        let relay = &active.relay;
        let ping = &active.ping_response;
        let request = self.prepare_request(template, active).await?;

        self.verify_view_call(&request, ping.max_acceptance_budget)
            .await?;

        let raw_tx = match self.http.relay_transaction(&relay.relay_url, &request).await {
            Ok(raw_tx) => raw_tx,
            Err(err) => {
                if err.should_penalize_relay() {
                    self.known_relays
                        .save_relay_failure_now(Some(relay.relay_manager), &relay.relay_url)
                        .await;
                }
                return Err(err);
            }
        };

        let hub = self.chain.relay_hub_address();
        let validation =
            validate_relay_response(&request, hub, ping.max_acceptance_budget, &raw_tx);
        if !matches!(validation, Ok(true)) {
            self.known_relays
                .save_relay_failure_now(Some(relay.relay_manager), &relay.relay_url)
                .await;
            return Err(match validation {
                Err(err) => err,
                Ok(_) => RelayClientError::ValidationFailed,
            });
        }

        let tx_hash = self.broadcast(&raw_tx).await;
        info!(?tx_hash, "Relayed transaction");
        Ok(RelayedTransaction {
            raw_tx,
            tx_hash,
            relay_url: relay.relay_url.clone(),
        })
    }

    /// Fill in the relay's fields, sign, and attach the approval data and
    /// the max relay nonce.
    async fn prepare_request(
        &self,
        template: &RelayRequest,
        active: &ActiveRelay,
    ) -> Result<RelayTransactionRequest, RelayClientError> {
        let relay = &active.relay;
        let worker = active.ping_response.relay_worker_address;
        let unsigned = template.clone_with_overrides(RelayRequestOverrides {
            relay_worker: Some(worker),
            pct_relay_fee: Some(relay.pct_relay_fee),
            base_relay_fee: Some(relay.base_relay_fee),
            ..Default::default()
        });
        let paymaster_data = self
            .data_callback
            .paymaster_data(&unsigned)
            .await
            .map_err(|err| RelayClientError::Callback {
                kind: "paymaster",
                message: err.to_string(),
            })?;
        let relay_request = unsigned.clone_with_overrides(RelayRequestOverrides {
            paymaster_data: Some(paymaster_data),
            ..Default::default()
        });

        let signature = self
            .signer
            .sign_request(&relay_request, self.chain.chain_id())
            .await?;
        let approval_data = self
            .data_callback
            .approval_data(&relay_request)
            .await
            .map_err(|err| RelayClientError::Callback {
                kind: "approval",
                message: err.to_string(),
            })?;

        let worker_nonce = self
            .chain
            .get_transaction_count(worker, NonceTag::Pending)
            .await?;
        let relay_max_nonce = worker_nonce
            .saturating_add(U256::from(self.config.max_relay_nonce_gap))
            .min(U256::from(u64::MAX))
            .as_u64();
        debug!(?worker, relay_max_nonce, "Prepared relay request");

        Ok(RelayTransactionRequest {
            relay_request,
            metadata: RelayMetadata {
                signature,
                approval_data,
                relay_hub_address: self.chain.relay_hub_address(),
                relay_max_nonce,
            },
        })
    }

    /// Dry run the `relayCall` the relay would submit, as its worker, with
    /// the block gas limit.
    async fn verify_view_call(
        &self,
        request: &RelayTransactionRequest,
        max_acceptance_budget: U256,
    ) -> Result<(), RelayClientError> {
        let block_gas_limit = self.chain.get_block_gas_limit().await?;
        let calldata = encode_relay_call(
            max_acceptance_budget,
            &request.relay_request,
            &request.metadata.signature,
            &request.metadata.approval_data,
            block_gas_limit,
        );
        let relay_data = &request.relay_request.relay_data;
        let simulation = self
            .chain
            .simulate_relay_call(
                relay_data.relay_worker,
                calldata,
                relay_data.gas_price,
                block_gas_limit,
            )
            .await
            .map_err(|err| RelayClientError::LocalViewCallReverted(err.to_string()))?;

        let reason = || {
            simulation
                .revert_reason()
                .unwrap_or_else(|| "unknown reason".to_owned())
        };
        if simulation.reverted {
            Err(RelayClientError::LocalViewCallReverted(reason()))
        } else if !simulation.paymaster_accepted {
            Err(RelayClientError::PaymasterRejected(reason()))
        } else {
            Ok(())
        }
    }

    /// Broadcast a relayed transaction ourselves. Failures are logged only;
    /// the relay is expected to have broadcast it already.
    async fn broadcast(&self, raw_tx: &Bytes) -> H256 {
        let tx_hash = H256::from(keccak256(raw_tx));
        match self.chain.broadcast_transaction(raw_tx.clone()).await {
            Ok(_) => debug!(?tx_hash, "Broadcast relayed transaction"),
            Err(err) if BENIGN_BROADCAST_ERROR.is_match(&err.to_string()) => {
                debug!(?tx_hash, %err, "Relayed transaction already known to the node")
            }
            Err(err) => warn!(?tx_hash, %err, "Failed to broadcast relayed transaction"),
        }
        tx_hash
    }
}
