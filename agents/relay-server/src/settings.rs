//! Relay server configuration.
//!
//! Loaded with [`relay_base::settings::load_settings`] under the
//! `RELAY_SERVER` prefix, e.g. `RELAY_SERVER_PORT=8091`,
//! `RELAY_SERVER_RELAY_HUB_ADDRESS=0x...` or
//! `RELAY_SERVER_TRACING__LEVEL=debug`. Every field has a default.

use std::path::PathBuf;
use std::time::Duration;

use ethers::types::{Address, U256};
use serde::Deserialize;

use relay_base::settings::{load_settings, TracingConfig};

use crate::handler::RelayServerConfig;
use crate::transaction_manager::TransactionManagerConfig;

const ENV_PREFIX: &str = "RELAY_SERVER";
const GWEI: u64 = 1_000_000_000;

/// Settings of the relay server binary. Amounts are in wei.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayServerSettings {
    /// Holds the transaction store and the key directories
    pub workdir: PathBuf,
    /// HTTP port
    pub port: u16,
    /// JSON-RPC endpoint of the node
    pub rpc_url: String,
    /// Hub the relay is registered with
    pub relay_hub_address: Address,
    /// Stake manager of the hub
    pub stake_manager_address: Address,
    /// Flat fee required per relayed call
    pub base_relay_fee: u64,
    /// Percentage fee required on top of the gas cost
    pub pct_relay_fee: u64,
    /// Markup over the network gas price, in percent
    pub gas_price_factor_percent: u64,
    /// Floor of the advertised minimum gas price
    pub min_gas_price: u64,
    /// Largest paymaster acceptance budget the relay risks
    pub max_acceptance_budget: u64,
    /// Gas added to a request's own gas for the hub's bookkeeping
    pub relay_call_gas_overhead: u64,
    /// Number of worker keys
    pub workers_count: u32,
    /// Blocks after which an unmined transaction is boosted and resent
    pub pending_transaction_timeout_blocks: u64,
    /// Gas price growth of a resent transaction, in percent
    pub gas_price_bump_percent: u64,
    /// Ceiling of boosted gas prices
    pub max_gas_price: u64,
    /// How often to look for a new block to reconcile on
    pub reconcile_interval_seconds: u64,
    /// Wipe the transaction store on startup
    pub dev_mode: bool,
    /// Logging
    pub tracing: TracingConfig,
}

impl Default for RelayServerSettings {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("./relay-server-data"),
            port: 8090,
            rpc_url: "http://localhost:8545".into(),
            relay_hub_address: Address::zero(),
            stake_manager_address: Address::zero(),
            base_relay_fee: 0,
            pct_relay_fee: 0,
            gas_price_factor_percent: 20,
            min_gas_price: 0,
            max_acceptance_budget: 285_252,
            relay_call_gas_overhead: 100_000,
            workers_count: 1,
            pending_transaction_timeout_blocks: 30,
            gas_price_bump_percent: 20,
            max_gas_price: 500 * GWEI,
            reconcile_interval_seconds: 15,
            dev_mode: false,
            tracing: TracingConfig::default(),
        }
    }
}

impl RelayServerSettings {
    /// Load from config files and the environment
    pub fn load() -> eyre::Result<Self> {
        load_settings(ENV_PREFIX)
    }

    /// What the request handler enforces
    pub fn relay_server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            base_relay_fee: self.base_relay_fee.into(),
            pct_relay_fee: self.pct_relay_fee.into(),
            gas_price_factor_percent: self.gas_price_factor_percent,
            min_gas_price: self.min_gas_price.into(),
            max_acceptance_budget: self.max_acceptance_budget.into(),
            relay_call_gas_overhead: self.relay_call_gas_overhead.into(),
        }
    }

    /// Resubmission settings of the transaction manager
    pub fn transaction_manager_config(&self) -> TransactionManagerConfig {
        TransactionManagerConfig {
            pending_transaction_timeout_blocks: self.pending_transaction_timeout_blocks,
            gas_price_bump_percent: self.gas_price_bump_percent,
            max_gas_price: U256::from(self.max_gas_price),
        }
    }

    /// Poll interval of the reconciliation loop
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }
}
