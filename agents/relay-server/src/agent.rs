use std::fs;
use std::sync::Arc;

use ethers::providers::{Http, Provider};
use eyre::{eyre, Result, WrapErr};
use prometheus::Registry;
use tracing::{info, instrument, warn};

use relay_base::{CoreMetrics, Server};
use relay_core::RelayChain;
use relay_ethereum::EthereumRelayChain;

use crate::handler::RelayServer;
use crate::key_manager::{KeyManager, SignerRole};
use crate::server::RelayApi;
use crate::settings::RelayServerSettings;
use crate::transaction_manager::{TransactionManager, TransactionManagerMetrics};
use crate::tx_store::{RocksTxStore, TxStore};

const AGENT_NAME: &str = "relay_server";
const TX_STORE_DIR: &str = "txstore";

/// The relay server process: HTTP endpoints plus the reconciliation loop.
#[derive(Debug)]
pub struct RelayServerAgent {
    settings: RelayServerSettings,
    server: Arc<RelayServer>,
    tx_manager: Arc<TransactionManager>,
    core_metrics: Arc<CoreMetrics>,
}

impl RelayServerAgent {
    /// Connect to the chain, open the store and keys, and build the server.
    #[instrument(skip_all)]
    pub async fn from_settings(settings: RelayServerSettings) -> Result<Self> {
        let provider = Provider::<Http>::try_from(settings.rpc_url.as_str())
            .wrap_err_with(|| format!("Invalid rpc url {}", settings.rpc_url))?;
        let chain = EthereumRelayChain::connect(
            Arc::new(provider),
            settings.relay_hub_address,
            settings.stake_manager_address,
        )
        .await
        .wrap_err("Failed to connect to the chain")?;
        let chain_id = chain.chain_id();
        let chain: Arc<dyn RelayChain> = Arc::new(chain);

        fs::create_dir_all(&settings.workdir)
            .wrap_err_with(|| format!("Failed to create workdir {:?}", settings.workdir))?;
        let store = RocksTxStore::open(&settings.workdir.join(TX_STORE_DIR))?;
        if settings.dev_mode {
            warn!("Dev mode, clearing the transaction store");
            store.clear_all().await?;
        }
        let keys = KeyManager::open(&settings.workdir, settings.workers_count, chain_id)?;

        let core_metrics = Arc::new(CoreMetrics::new(AGENT_NAME, Registry::new())?);
        let tx_manager = Arc::new(TransactionManager::new(
            chain.clone(),
            Arc::new(store),
            keys.transaction_signers(),
            settings.transaction_manager_config(),
            TransactionManagerMetrics::new(&core_metrics)?,
        ));
        let server = Arc::new(RelayServer::new(
            chain,
            tx_manager.clone(),
            settings.relay_server_config(),
            core_metrics.clone(),
        )?);

        info!(
            agent = core_metrics.agent_name(),
            chain_id,
            hub = ?settings.relay_hub_address,
            manager = ?keys.address(SignerRole::Manager),
            workers = ?keys.worker_addresses(),
            "Relay server initialized"
        );
        Ok(Self {
            settings,
            server,
            tx_manager,
            core_metrics,
        })
    }

    /// Serve until the HTTP server or the reconciliation loop stops.
    pub async fn run(self) -> Result<()> {
        let api = RelayApi::new(self.server.clone());
        let http = Arc::new(Server::new(self.settings.port, self.core_metrics.clone()))
            .run_with_custom_router(api.router());
        let reconciliation = self
            .tx_manager
            .clone()
            .spawn_reconciliation(self.settings.reconcile_interval());

        tokio::select! {
            res = http => {
                res.wrap_err("HTTP server panicked")??;
                Err(eyre!("HTTP server exited"))
            }
            res = reconciliation => {
                res.wrap_err("Reconciliation loop panicked")?;
                Err(eyre!("Reconciliation loop exited"))
            }
        }
    }
}
