use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{transaction::eip2718::TypedTransaction, Address, Signature};
use tracing::info;

const MANAGER_DIR: &str = "manager";
const WORKERS_DIR: &str = "workers";

/// Which key of the relay a transaction is signed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignerRole {
    /// The relay manager, registered with the stake manager
    Manager,
    /// A relay worker, signing `relayCall` transactions
    Worker(u32),
}

impl Display for SignerRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SignerRole::Manager => write!(f, "manager"),
            SignerRole::Worker(index) => write!(f, "worker-{index}"),
        }
    }
}

/// Signs the transactions of one relay key.
#[async_trait]
pub trait TransactionSigner: Send + Sync + std::fmt::Debug {
    /// Address of the key
    fn signer_address(&self) -> Address;

    /// Sign a fully populated transaction
    async fn sign_tx(&self, tx: &TypedTransaction) -> Result<Signature, String>;
}

#[async_trait]
impl TransactionSigner for LocalWallet {
    fn signer_address(&self) -> Address {
        self.address()
    }

    async fn sign_tx(&self, tx: &TypedTransaction) -> Result<Signature, String> {
        self.sign_transaction(tx).await.map_err(|e| e.to_string())
    }
}

/// Key manager errors
#[derive(Debug, thiserror::Error)]
pub enum KeyManagerError {
    /// Reading or writing a key file failed
    #[error("Key file {path:?}: {source}")]
    Io {
        /// Key file
        path: PathBuf,
        /// Cause
        #[source]
        source: std::io::Error,
    },
    /// A key file does not hold a valid private key
    #[error("Invalid private key in {path:?}: {message}")]
    InvalidKey {
        /// Key file
        path: PathBuf,
        /// Why parsing failed
        message: String,
    },
}

/// Local keys of the relay, one directory per role under the working
/// directory and one hex encoded private key file per index. Missing keys are
/// generated on first start.
#[derive(Debug, Clone)]
pub struct KeyManager {
    wallets: BTreeMap<SignerRole, LocalWallet>,
}

impl KeyManager {
    /// Load or create the manager key and `workers_count` worker keys.
    pub fn open(
        workdir: &Path,
        workers_count: u32,
        chain_id: u64,
    ) -> Result<Self, KeyManagerError> {
        let mut wallets = BTreeMap::new();
        let manager = load_or_create(&workdir.join(MANAGER_DIR).join("0.key"))?;
        wallets.insert(SignerRole::Manager, manager.with_chain_id(chain_id));
        for index in 0..workers_count {
            let path = workdir.join(WORKERS_DIR).join(format!("{index}.key"));
            let worker = load_or_create(&path)?;
            wallets.insert(SignerRole::Worker(index), worker.with_chain_id(chain_id));
        }
        Ok(Self { wallets })
    }

    /// Key manager over in-memory wallets
    pub fn from_wallets(wallets: impl IntoIterator<Item = (SignerRole, LocalWallet)>) -> Self {
        Self {
            wallets: wallets.into_iter().collect(),
        }
    }

    /// Wallet of a role
    pub fn wallet(&self, role: SignerRole) -> Option<&LocalWallet> {
        self.wallets.get(&role)
    }

    /// Address of a role
    pub fn address(&self, role: SignerRole) -> Option<Address> {
        self.wallet(role).map(Signer::address)
    }

    /// Every role and its address
    pub fn signers(&self) -> impl Iterator<Item = (SignerRole, Address)> + '_ {
        self.wallets
            .iter()
            .map(|(role, wallet)| (*role, wallet.address()))
    }

    /// Every role with its signer
    pub fn transaction_signers(&self) -> Vec<(SignerRole, Arc<dyn TransactionSigner>)> {
        self.wallets
            .iter()
            .map(|(role, wallet)| {
                let signer: Arc<dyn TransactionSigner> = Arc::new(wallet.clone());
                (*role, signer)
            })
            .collect()
    }

    /// Addresses of the workers, in index order
    pub fn worker_addresses(&self) -> Vec<Address> {
        self.signers()
            .filter(|(role, _)| matches!(role, SignerRole::Worker(_)))
            .map(|(_, address)| address)
            .collect()
    }
}

fn load_or_create(path: &Path) -> Result<LocalWallet, KeyManagerError> {
    let io_err = |source| KeyManagerError::Io {
        path: path.to_owned(),
        source,
    };
    if path.is_file() {
        let key = fs::read_to_string(path).map_err(io_err)?;
        return LocalWallet::from_str(key.trim()).map_err(|e| KeyManagerError::InvalidKey {
            path: path.to_owned(),
            message: e.to_string(),
        });
    }

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_err)?;
    }
    let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
    fs::write(path, hex::encode(wallet.signer().to_bytes())).map_err(io_err)?;
    info!(path = ?path, address = ?wallet.address(), "Generated new key");
    Ok(wallet)
}
