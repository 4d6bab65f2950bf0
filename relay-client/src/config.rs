use std::time::Duration;

use ethers::types::Address;
use serde::Deserialize;

/// Client settings. Every field has a default so a partial config is enough.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayClientConfig {
    /// Relays to try before any discovered relay, in this order
    pub preferred_relays: Vec<String>,
    /// How far back to look for active relay managers
    pub relay_lookup_window_blocks: u64,
    /// Initial number of sub-ranges the lookback window is split into
    pub relay_lookup_window_parts: u64,
    /// How many times the window part count may be doubled after the node
    /// refuses a range for holding too many results
    pub max_window_part_doublings: u32,
    /// Markup over the network gas price, in percent
    pub gas_price_factor_percent: u64,
    /// Lowest gas price ever offered
    pub min_gas_price: u64,
    /// How many transactions ahead of the worker's current count the relay
    /// may place ours
    pub max_relay_nonce_gap: u64,
    /// How many relays are pinged concurrently
    pub slice_size: usize,
    /// How long a recorded relay failure affects scoring
    pub relay_timeout_grace_seconds: u64,
    /// Ping timeout
    pub ping_timeout_ms: u64,
    /// Submission timeout
    pub relay_timeout_ms: u64,
    /// Paymaster sponsoring the transactions
    pub paymaster_address: Address,
    /// Forwarder to use instead of the recipient's declared one
    pub forwarder_address: Option<Address>,
    /// Identifier sent in every request
    pub client_id: u64,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            preferred_relays: vec![],
            relay_lookup_window_blocks: 60_000,
            relay_lookup_window_parts: 1,
            max_window_part_doublings: 8,
            gas_price_factor_percent: 20,
            min_gas_price: 0,
            max_relay_nonce_gap: 3,
            slice_size: 3,
            relay_timeout_grace_seconds: 1800,
            ping_timeout_ms: 5_000,
            relay_timeout_ms: 30_000,
            paymaster_address: Address::zero(),
            forwarder_address: None,
            client_id: 1,
        }
    }
}

impl RelayClientConfig {
    /// Load the config from `./config`, `CONFIG_FILES` and `RELAY_CLIENT_*`
    /// environment variables.
    pub fn load() -> eyre::Result<Self> {
        relay_base::settings::load_settings("RELAY_CLIENT")
    }

    /// Ping timeout
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Submission timeout
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    /// How long a recorded relay failure affects scoring, in milliseconds
    pub fn relay_timeout_grace_millis(&self) -> u64 {
        self.relay_timeout_grace_seconds.saturating_mul(1000)
    }
}
