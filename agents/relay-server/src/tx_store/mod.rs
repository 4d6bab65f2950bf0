use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use relay_base::db::{DbError, WriteBatch, DB};


const TX_BY_NONCE: &[u8] = b"tx_by_nonce_";
const TX_ID: &[u8] = b"tx_id_";

/// A signed transaction the server is responsible for until the chain
/// confirms its nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTransaction {
    /// Signing key
    pub signer: Address,
    /// Nonce of the signer
    pub nonce: u64,
    /// Hash of `raw_tx`
    pub tx_id: H256,
    /// Destination
    pub to: Address,
    /// Calldata
    pub data: Bytes,
    /// Value
    pub value: U256,
    /// Gas limit
    pub gas_limit: U256,
    /// Gas price of the latest signed version
    pub gas_price: U256,
    /// Latest signed version, RLP encoded
    pub raw_tx: Bytes,
    /// How many times the transaction has been signed
    pub attempts: u32,
    /// When the nonce was first assigned
    pub created_at: DateTime<Utc>,
    /// Block number at the time of the latest broadcast
    pub sent_at_block: u64,
    /// The latest signed version has not reached the node yet
    #[serde(default)]
    pub broadcast_pending: bool,
}

/// Transaction store errors
#[derive(Debug, thiserror::Error)]
pub enum TxStoreError {
    /// Underlying database failure
    #[error(transparent)]
    Db(#[from] DbError),
    /// A row for the signer and nonce exists and overwriting was not allowed
    #[error("Transaction of signer {signer:?} with nonce {nonce} violates the unique constraint")]
    UniqueConstraintViolation {
        /// Signer
        signer: Address,
        /// Nonce
        nonce: u64,
    },
}

/// Store result
pub type TxStoreResult<T> = Result<T, TxStoreError>;

/// Durable table of in-flight transactions, unique per `(signer, nonce)`.
#[async_trait]
pub trait TxStore: Send + Sync + Debug {
    /// Insert a transaction. With `allow_overwrite` an existing row for the
    /// same signer and nonce is replaced; otherwise the insert fails and the
    /// existing row is left as is.
    async fn put_tx(&self, tx: &StoredTransaction, allow_overwrite: bool) -> TxStoreResult<()>;

    /// Look a transaction up by the hash of its latest signed version
    async fn get_tx_by_id(&self, tx_id: H256) -> TxStoreResult<Option<StoredTransaction>>;

    /// Look a transaction up by signer and nonce
    async fn get_tx_by_nonce(
        &self,
        signer: Address,
        nonce: u64,
    ) -> TxStoreResult<Option<StoredTransaction>>;

    /// Remove the transaction of a signer with the given nonce
    async fn remove_tx_by_nonce(&self, signer: Address, nonce: u64) -> TxStoreResult<()>;

    /// Remove every transaction of a signer with a nonce up to and including
    /// `nonce`. Returns how many were removed.
    async fn remove_txs_until_nonce(&self, signer: Address, nonce: u64) -> TxStoreResult<usize>;

    /// Every stored transaction, ordered by signer then nonce
    async fn get_all(&self) -> TxStoreResult<Vec<StoredTransaction>>;

    /// Transactions of one signer, ordered by nonce
    async fn get_all_for_signer(&self, signer: Address) -> TxStoreResult<Vec<StoredTransaction>>;

    /// Remove everything
    async fn clear_all(&self) -> TxStoreResult<()>;
}

/// [`TxStore`] on RocksDB. Rows are keyed
/// `tx_by_nonce_<signer><nonce as big endian>` so that a prefix scan yields a
/// signer's transactions in nonce order; `tx_id_<hash>` indexes them by hash.
#[derive(Debug)]
pub struct RocksTxStore {
    db: DB,
    /// Serializes the read-check-write of inserts and removals
    write_lock: Mutex<()>,
}

fn signer_prefix(signer: Address) -> Vec<u8> {
    [TX_BY_NONCE, signer.as_bytes()].concat()
}

fn nonce_key(signer: Address, nonce: u64) -> Vec<u8> {
    [TX_BY_NONCE, signer.as_bytes(), &nonce.to_be_bytes()].concat()
}

fn id_key(tx_id: H256) -> Vec<u8> {
    [TX_ID, tx_id.as_bytes()].concat()
}

impl RocksTxStore {
    /// Store on an open database
    pub fn new(db: DB) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// Open or create the store at `path`
    pub fn open(path: &Path) -> TxStoreResult<Self> {
        Ok(Self::new(DB::from_path(path)?))
    }

    fn decode_all(&self, prefix: &[u8]) -> TxStoreResult<Vec<StoredTransaction>> {
        self.db
            .prefix_entries(prefix)?
            .into_iter()
            .map(|(_, value)| {
                serde_json::from_slice(&value).map_err(|e| TxStoreError::Db(e.into()))
            })
            .collect()
    }

    fn remove_in_batch(batch: &mut WriteBatch, tx: &StoredTransaction) {
        batch.delete(nonce_key(tx.signer, tx.nonce));
        batch.delete(id_key(tx.tx_id));
    }
}

#[async_trait]
impl TxStore for RocksTxStore {
    #[instrument(skip(self, tx), fields(signer = ?tx.signer, nonce = tx.nonce), err)]
    async fn put_tx(&self, tx: &StoredTransaction, allow_overwrite: bool) -> TxStoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let key = nonce_key(tx.signer, tx.nonce);
        let existing: Option<StoredTransaction> = self.db.retrieve_json(&key)?;

        let mut batch = WriteBatch::default();
        if let Some(existing) = existing {
            if !allow_overwrite {
                return Err(TxStoreError::UniqueConstraintViolation {
                    signer: tx.signer,
                    nonce: tx.nonce,
                });
            }
            batch.delete(id_key(existing.tx_id));
        }
        batch.put(&key, serde_json::to_vec(tx).map_err(DbError::from)?);
        batch.put(id_key(tx.tx_id), &key);
        self.db.write(batch)?;
        debug!(tx_id = ?tx.tx_id, attempts = tx.attempts, "Stored transaction");
        Ok(())
    }

    async fn get_tx_by_id(&self, tx_id: H256) -> TxStoreResult<Option<StoredTransaction>> {
        match self.db.retrieve(&id_key(tx_id))? {
            Some(key) => Ok(self.db.retrieve_json(&key)?),
            None => Ok(None),
        }
    }

    async fn get_tx_by_nonce(
        &self,
        signer: Address,
        nonce: u64,
    ) -> TxStoreResult<Option<StoredTransaction>> {
        Ok(self.db.retrieve_json(&nonce_key(signer, nonce))?)
    }

    async fn remove_tx_by_nonce(&self, signer: Address, nonce: u64) -> TxStoreResult<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(tx) = self
            .db
            .retrieve_json::<StoredTransaction>(&nonce_key(signer, nonce))?
        {
            let mut batch = WriteBatch::default();
            Self::remove_in_batch(&mut batch, &tx);
            self.db.write(batch)?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn remove_txs_until_nonce(&self, signer: Address, nonce: u64) -> TxStoreResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for tx in self
            .decode_all(&signer_prefix(signer))?
            .iter()
            .take_while(|tx| tx.nonce <= nonce)
        {
            Self::remove_in_batch(&mut batch, tx);
            removed += 1;
        }
        if removed > 0 {
            self.db.write(batch)?;
            debug!(removed, "Removed confirmed transactions");
        }
        Ok(removed)
    }

    async fn get_all(&self) -> TxStoreResult<Vec<StoredTransaction>> {
        self.decode_all(TX_BY_NONCE)
    }

    async fn get_all_for_signer(&self, signer: Address) -> TxStoreResult<Vec<StoredTransaction>> {
        self.decode_all(&signer_prefix(signer))
    }

    async fn clear_all(&self) -> TxStoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut batch = WriteBatch::default();
        for prefix in [TX_BY_NONCE, TX_ID] {
            for (key, _) in self.db.prefix_entries(prefix)? {
                batch.delete(key);
            }
        }
        self.db.write(batch)?;
        Ok(())
    }
}
