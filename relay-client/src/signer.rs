use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes};

use relay_core::RelayRequest;

use crate::RelayClientError;

/// Produces the sender's signature over a relay request.
#[async_trait]
pub trait RequestSigner: Send + Sync + Debug {
    /// Sign `request` as EIP-712 typed data on chain `chain_id`
    async fn sign_request(
        &self,
        request: &RelayRequest,
        chain_id: u64,
    ) -> Result<Bytes, RelayClientError>;
}

/// Holds local keys of the senders this client relays for.
#[derive(Debug, Default)]
pub struct AccountManager {
    wallets: HashMap<Address, LocalWallet>,
}

impl AccountManager {
    /// Manager without keys
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, returning its address
    pub fn add_wallet(&mut self, wallet: LocalWallet) -> Address {
        let address = wallet.address();
        self.wallets.insert(address, wallet);
        address
    }

    /// Generate a fresh key, returning its address
    pub fn new_account(&mut self) -> Address {
        self.add_wallet(LocalWallet::new(&mut ethers::core::rand::thread_rng()))
    }

    /// Addresses with a key
    pub fn accounts(&self) -> impl Iterator<Item = &Address> {
        self.wallets.keys()
    }
}

#[async_trait]
impl RequestSigner for AccountManager {
    async fn sign_request(
        &self,
        request: &RelayRequest,
        chain_id: u64,
    ) -> Result<Bytes, RelayClientError> {
        let sender = request.request.from;
        let wallet = self
            .wallets
            .get(&sender)
            .ok_or(RelayClientError::MissingSigner(sender))?;
        let signature = wallet
            .sign_typed_data(&request.typed(chain_id))
            .await
            .map_err(|err| RelayClientError::Signing(err.to_string()))?;
        Ok(signature.to_vec().into())
    }
}
