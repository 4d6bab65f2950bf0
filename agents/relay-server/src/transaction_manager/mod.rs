use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, H256, U256,
};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use relay_core::{u256_to_u64, ChainCommunicationError, NonceTag, RelayChain};

use crate::key_manager::{SignerRole, TransactionSigner};
use crate::tx_store::{StoredTransaction, TxStore, TxStoreError};

pub use metrics::TransactionManagerMetrics;

mod metrics;

/// Node answers to a broadcast that mean the transaction, or one replacing
/// it, is already known.
static BENIGN_BROADCAST_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)known transaction|already known|nonce too low|correct nonce")
        .expect("valid regex")
});

/// Resubmission settings
#[derive(Debug, Clone)]
pub struct TransactionManagerConfig {
    /// Blocks after which an unmined transaction is boosted and resent
    pub pending_transaction_timeout_blocks: u64,
    /// How much a resent transaction's gas price grows, in percent
    pub gas_price_bump_percent: u64,
    /// Ceiling of boosted gas prices
    pub max_gas_price: U256,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            pending_transaction_timeout_blocks: 30,
            gas_price_bump_percent: 20,
            max_gas_price: U256::from(500_000_000_000u64),
        }
    }
}

/// What to send. The nonce is assigned by the manager.
#[derive(Debug, Clone, Default)]
pub struct TxParams {
    /// Destination
    pub to: Address,
    /// Calldata
    pub data: Bytes,
    /// Value
    pub value: U256,
    /// Gas limit
    pub gas_limit: U256,
    /// Gas price
    pub gas_price: U256,
    /// Reject instead of signing if the assigned nonce would exceed this
    pub max_nonce: Option<u64>,
}

/// A signed and stored transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
    /// Hash of the signed transaction
    pub tx_id: H256,
    /// Assigned nonce
    pub nonce: u64,
    /// RLP encoded signed transaction
    pub raw_tx: Bytes,
}

/// Outcome of one reconciliation sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Transactions purged because their nonce was mined
    pub removed: usize,
    /// Transactions boosted and broadcast again
    pub resent: usize,
    /// Signers halted during the sweep
    pub halted: usize,
    /// Signers whose sweep failed on a chain or store error
    pub errors: usize,
}

/// Transaction manager errors
#[derive(Debug, thiserror::Error)]
pub enum TransactionManagerError {
    /// Reading or writing the transaction store failed
    #[error(transparent)]
    Store(#[from] TxStoreError),
    /// Talking to the chain failed
    #[error(transparent)]
    Chain(#[from] ChainCommunicationError),
    /// There is no key for the role
    #[error("No key configured for {0}")]
    UnknownSigner(SignerRole),
    /// A previous signing failure stopped the signer
    #[error("Signer {role} is halted: {reason}")]
    SignerHalted {
        /// Halted role
        role: SignerRole,
        /// The signing failure that halted it
        reason: String,
    },
    /// The key failed to sign
    #[error("Failed to sign transaction of {role}: {message}")]
    Signing {
        /// Signing role
        role: SignerRole,
        /// Signer error
        message: String,
    },
    /// The next nonce is above what the caller accepts
    #[error("Next nonce {nonce} is above the accepted maximum {max_nonce}")]
    NonceAboveMax {
        /// Nonce that would have been used
        nonce: u64,
        /// Highest accepted nonce
        max_nonce: u64,
    },
}

type Result<T> = std::result::Result<T, TransactionManagerError>;

#[derive(Debug, Default)]
struct SignerState {
    /// `None` until the first send or sweep after startup
    next_nonce: Option<u64>,
    halted: Option<String>,
}

#[derive(Debug)]
struct ManagedSigner {
    signer: Arc<dyn TransactionSigner>,
    state: Mutex<SignerState>,
}

/// Assigns nonces, signs, persists and broadcasts the transactions of the
/// relay keys, and keeps them moving until they are mined.
///
/// Nonce assignment, the store insert and the first broadcast happen under a
/// per-signer lock that the reconciliation sweep also takes, so sends of one
/// signer are serialized while different signers proceed in parallel.
#[derive(Debug)]
pub struct TransactionManager {
    chain: Arc<dyn RelayChain>,
    store: Arc<dyn TxStore>,
    signers: BTreeMap<SignerRole, ManagedSigner>,
    config: TransactionManagerConfig,
    metrics: TransactionManagerMetrics,
}

impl TransactionManager {
    /// Create a manager for the given signers
    pub fn new(
        chain: Arc<dyn RelayChain>,
        store: Arc<dyn TxStore>,
        signers: impl IntoIterator<Item = (SignerRole, Arc<dyn TransactionSigner>)>,
        config: TransactionManagerConfig,
        metrics: TransactionManagerMetrics,
    ) -> Self {
        let signers = signers
            .into_iter()
            .map(|(role, signer)| {
                let managed = ManagedSigner {
                    signer,
                    state: Mutex::new(SignerState::default()),
                };
                (role, managed)
            })
            .collect();
        Self {
            chain,
            store,
            signers,
            config,
            metrics,
        }
    }

    /// The transaction store
    pub fn store(&self) -> &Arc<dyn TxStore> {
        &self.store
    }

    /// Address of a role
    pub fn signer_address(&self, role: SignerRole) -> Option<Address> {
        self.signers
            .get(&role)
            .map(|managed| managed.signer.signer_address())
    }

    /// Whether a signing failure stopped the role. Unknown roles count as
    /// halted.
    pub async fn is_halted(&self, role: SignerRole) -> bool {
        match self.signers.get(&role) {
            Some(managed) => managed.state.lock().await.halted.is_some(),
            None => true,
        }
    }

    /// Assign the next nonce of `role`, sign, store and broadcast. The stored
    /// row outlives a failed broadcast and is marked for the next sweep to
    /// send again unchanged.
    #[instrument(skip(self, params), fields(to = ?params.to), err)]
    pub async fn send_transaction(
        &self,
        role: SignerRole,
        params: TxParams,
    ) -> Result<SentTransaction> {
        let managed = self
            .signers
            .get(&role)
            .ok_or(TransactionManagerError::UnknownSigner(role))?;
        let address = managed.signer.signer_address();

        let mut state = managed.state.lock().await;
        if let Some(reason) = &state.halted {
            return Err(TransactionManagerError::SignerHalted {
                role,
                reason: reason.clone(),
            });
        }
        let nonce = match state.next_nonce {
            Some(nonce) => nonce,
            None => self.initial_nonce(address).await?,
        };
        state.next_nonce = Some(nonce);
        if let Some(max_nonce) = params.max_nonce {
            if nonce > max_nonce {
                return Err(TransactionManagerError::NonceAboveMax { nonce, max_nonce });
            }
        }
        let sent_at_block = self.chain.get_block_number().await?;

        let tx = self.populate(address, nonce, &params);
        let (tx_id, raw_tx) = match self.sign(managed, role, &tx).await {
            Ok(signed) => signed,
            Err(err) => {
                state.halted = Some(err.to_string());
                error!(?err, ?address, "Signing failed, halting signer");
                return Err(err);
            }
        };
        let mut stored = StoredTransaction {
            signer: address,
            nonce,
            tx_id,
            to: params.to,
            data: params.data,
            value: params.value,
            gas_limit: params.gas_limit,
            gas_price: params.gas_price,
            raw_tx,
            attempts: 1,
            created_at: Utc::now(),
            sent_at_block,
            broadcast_pending: false,
        };
        self.store.put_tx(&stored, false).await?;
        state.next_nonce = Some(nonce + 1);

        let label = role.to_string();
        self.metrics.sent.with_label_values(&[&label]).inc();
        self.metrics.pending.with_label_values(&[&label]).inc();
        info!(nonce = stored.nonce, tx_id = ?stored.tx_id, "Stored new transaction");

        if let Err(err) = self.broadcast(&stored).await {
            stored.broadcast_pending = true;
            self.store.put_tx(&stored, true).await?;
            return Err(err);
        }
        Ok(SentTransaction {
            tx_id: stored.tx_id,
            nonce: stored.nonce,
            raw_tx: stored.raw_tx,
        })
    }

    /// Purge transactions whose nonce the chain has mined, then boost and
    /// resend those that stayed pending for longer than the timeout. Rows
    /// whose last broadcast failed are sent again unchanged.
    ///
    /// Each signer is swept on its own; a chain or store error is logged,
    /// counted in the summary, and the sweep moves on to the next signer.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, current_block: u64) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for (role, managed) in &self.signers {
            if let Err(err) = self
                .reconcile_signer(*role, managed, current_block, &mut summary)
                .await
            {
                summary.errors += 1;
                warn!(%role, ?err, "Failed to reconcile signer");
            }
        }
        if summary != ReconcileSummary::default() {
            info!(?summary, current_block, "Reconciled pending transactions");
        }
        summary
    }

    async fn reconcile_signer(
        &self,
        role: SignerRole,
        managed: &ManagedSigner,
        current_block: u64,
        summary: &mut ReconcileSummary,
    ) -> Result<()> {
        let mut state = managed.state.lock().await;
        if state.halted.is_some() {
            return Ok(());
        }
        let address = managed.signer.signer_address();
        let mined = u256_to_u64(
            self.chain
                .get_transaction_count(address, NonceTag::Latest)
                .await?,
        )?;
        if mined > 0 {
            summary.removed += self.store.remove_txs_until_nonce(address, mined - 1).await?;
        }

        let pending = self.store.get_all_for_signer(address).await?;
        self.metrics
            .pending
            .with_label_values(&[&role.to_string()])
            .set(pending.len() as i64);

        for tx in pending {
            let stale = current_block.saturating_sub(tx.sent_at_block)
                >= self.config.pending_transaction_timeout_blocks;
            if !stale && !tx.broadcast_pending {
                continue;
            }
            match self.resend(managed, role, tx, current_block).await {
                Ok(true) => summary.resent += 1,
                Ok(false) => {}
                Err(err @ TransactionManagerError::Signing { .. }) => {
                    state.halted = Some(err.to_string());
                    summary.halted += 1;
                    error!(?err, ?address, "Signing failed, halting signer");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Run [`Self::reconcile`] whenever a new block is seen, polling every
    /// `interval`.
    pub fn spawn_reconciliation(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last_block = None;
            loop {
                ticker.tick().await;
                let block = match self.chain.get_block_number().await {
                    Ok(block) => block,
                    Err(err) => {
                        warn!(?err, "Failed to read block number");
                        continue;
                    }
                };
                if last_block == Some(block) {
                    continue;
                }
                last_block = Some(block);
                self.reconcile(block).await;
            }
        })
    }

    /// Gas price of the next attempt: bumped by the configured percentage,
    /// at least by one wei, and capped.
    pub fn bumped_gas_price(&self, gas_price: U256) -> U256 {
        let multiplier = U256::from(100 + self.config.gas_price_bump_percent);
        let bumped = gas_price.saturating_mul(multiplier) / 100;
        bumped
            .max(gas_price.saturating_add(U256::one()))
            .min(self.config.max_gas_price)
    }

    /// First nonce after startup: past anything the chain knows of, including
    /// the mempool, and past anything still in the store.
    async fn initial_nonce(&self, address: Address) -> Result<u64> {
        let chain_count = u256_to_u64(
            self.chain
                .get_transaction_count(address, NonceTag::Pending)
                .await?,
        )?;
        let stored_next = self
            .store
            .get_all_for_signer(address)
            .await?
            .last()
            .map_or(0, |tx| tx.nonce + 1);
        let nonce = chain_count.max(stored_next);
        debug!(?address, chain_count, stored_next, nonce, "Initialized nonce");
        Ok(nonce)
    }

    fn populate(&self, from: Address, nonce: u64, params: &TxParams) -> TypedTransaction {
        TransactionRequest::new()
            .from(from)
            .to(params.to)
            .data(params.data.clone())
            .value(params.value)
            .gas(params.gas_limit)
            .gas_price(params.gas_price)
            .nonce(nonce)
            .chain_id(self.chain.chain_id())
            .into()
    }

    async fn sign(
        &self,
        managed: &ManagedSigner,
        role: SignerRole,
        tx: &TypedTransaction,
    ) -> Result<(H256, Bytes)> {
        let signature = managed
            .signer
            .sign_tx(tx)
            .await
            .map_err(|message| TransactionManagerError::Signing { role, message })?;
        let raw_tx = tx.rlp_signed(&signature);
        Ok((H256(keccak256(&raw_tx)), raw_tx))
    }

    /// Returns whether the transaction reached the node. A row whose last
    /// broadcast failed goes out unchanged; otherwise it is re-signed with a
    /// bumped gas price first, unless the price is already at its cap.
    async fn resend(
        &self,
        managed: &ManagedSigner,
        role: SignerRole,
        tx: StoredTransaction,
        current_block: u64,
    ) -> Result<bool> {
        let gas_price = self.bumped_gas_price(tx.gas_price);
        let mut stored = if tx.broadcast_pending {
            debug!(nonce = tx.nonce, "Retrying failed broadcast");
            tx
        } else if gas_price > tx.gas_price {
            let params = TxParams {
                to: tx.to,
                data: tx.data.clone(),
                value: tx.value,
                gas_limit: tx.gas_limit,
                gas_price,
                max_nonce: None,
            };
            let populated = self.populate(tx.signer, tx.nonce, &params);
            let (tx_id, raw_tx) = self.sign(managed, role, &populated).await?;
            let boosted = StoredTransaction {
                tx_id,
                raw_tx,
                gas_price,
                attempts: tx.attempts + 1,
                broadcast_pending: true,
                ..tx
            };
            self.store.put_tx(&boosted, true).await?;
            debug!(
                nonce = boosted.nonce,
                %gas_price,
                attempts = boosted.attempts,
                "Boosted transaction"
            );
            boosted
        } else {
            debug!(nonce = tx.nonce, %gas_price, "Gas price at its cap, rebroadcasting");
            tx
        };

        if self.broadcast(&stored).await.is_err() {
            if !stored.broadcast_pending {
                stored.broadcast_pending = true;
                self.store.put_tx(&stored, true).await?;
            }
            return Ok(false);
        }
        stored.broadcast_pending = false;
        stored.sent_at_block = current_block;
        self.store.put_tx(&stored, true).await?;
        self.metrics
            .resent
            .with_label_values(&[&role.to_string()])
            .inc();
        Ok(true)
    }

    /// Broadcast the latest signed version of a stored transaction. Node
    /// answers saying it is already known count as success.
    async fn broadcast(&self, tx: &StoredTransaction) -> Result<()> {
        match self.chain.broadcast_transaction(tx.raw_tx.clone()).await {
            Ok(hash) => {
                debug!(nonce = tx.nonce, ?hash, "Broadcast transaction");
                Ok(())
            }
            Err(err) if BENIGN_BROADCAST_ERROR.is_match(&err.to_string()) => {
                debug!(nonce = tx.nonce, %err, "Transaction already known to the node");
                Ok(())
            }
            Err(err) => {
                warn!(
                    nonce = tx.nonce,
                    signer = ?tx.signer,
                    %err,
                    "Failed to broadcast transaction"
                );
                Err(err.into())
            }
        }
    }
}
