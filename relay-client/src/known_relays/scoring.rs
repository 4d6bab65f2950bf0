use std::fmt::Debug;

use ethers::types::U256;

use relay_core::{RelayCandidate, RelayFailureRecord, TransactionDetails};

/// Largest integer a double represents exactly
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
/// Score multiplier applied per recent failure
const FAILURE_DISCOUNT: f64 = 0.9;

/// Decides which relays are worth considering at all.
pub trait RelayFilter: Send + Sync + Debug {
    /// Whether the relay may be used
    fn accept(&self, relay: &RelayCandidate) -> bool;
}

/// Accepts every relay
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllFilter;

impl RelayFilter for AcceptAllFilter {
    fn accept(&self, _relay: &RelayCandidate) -> bool {
        true
    }
}

/// Ranks relays for a transaction. Higher is better.
pub trait RelayScore: Send + Sync + Debug {
    /// Score the relay given its recent failures
    fn score(
        &self,
        relay: &RelayCandidate,
        details: &TransactionDetails,
        failures: &[RelayFailureRecord],
    ) -> f64;

    /// Secondary sort key among equal scores. Higher goes first.
    fn tie_breaker(&self) -> f64 {
        0.0
    }
}

/// Prefers cheaper relays and discounts 10% per recent failure.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRelayScore {
    random_tie_break: bool,
}

impl Default for DefaultRelayScore {
    fn default() -> Self {
        Self {
            random_tie_break: true,
        }
    }
}

impl DefaultRelayScore {
    /// A scorer whose ties keep the discovery order
    pub fn deterministic() -> Self {
        Self {
            random_tie_break: false,
        }
    }

    /// `base_fee + gas * gas_price * (100 + pct_fee) / 100`, saturating
    pub fn transaction_cost(relay: &RelayCandidate, details: &TransactionDetails) -> U256 {
        let gas = details.gas.unwrap_or_default();
        let gas_price = details.gas_price.unwrap_or_default();
        let markup = U256::from(100).saturating_add(relay.pct_relay_fee);
        let variable = gas
            .saturating_mul(gas_price)
            .saturating_mul(markup)
            .checked_div(U256::from(100))
            .unwrap_or_default();
        relay.base_relay_fee.saturating_add(variable)
    }
}

fn to_f64(value: U256) -> f64 {
    if value > U256::from(u128::MAX) {
        f64::INFINITY
    } else {
        value.as_u128() as f64
    }
}

impl RelayScore for DefaultRelayScore {
    fn score(
        &self,
        relay: &RelayCandidate,
        details: &TransactionDetails,
        failures: &[RelayFailureRecord],
    ) -> f64 {
        let cost = to_f64(Self::transaction_cost(relay, details));
        let score = (MAX_SAFE_INTEGER - cost).max(0.0);
        score * FAILURE_DISCOUNT.powi(failures.len().min(i32::MAX as usize) as i32)
    }

    fn tie_breaker(&self) -> f64 {
        if self.random_tie_break {
            rand::random()
        } else {
            0.0
        }
    }
}
