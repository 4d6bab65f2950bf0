use std::fmt::{Debug, Formatter};

use prometheus::{IntCounterVec, IntGaugeVec};

use relay_base::CoreMetrics;

/// Transaction manager metrics, labeled by signer role
#[derive(Clone)]
pub struct TransactionManagerMetrics {
    pub(super) sent: IntCounterVec,
    pub(super) resent: IntCounterVec,
    pub(super) pending: IntGaugeVec,
}

impl TransactionManagerMetrics {
    /// Register the metrics with the agent's registry
    pub fn new(core: &CoreMetrics) -> prometheus::Result<Self> {
        Ok(Self {
            sent: core.new_int_counter(
                "transactions_sent_total",
                "Transactions signed with a fresh nonce",
                &["signer"],
            )?,
            resent: core.new_int_counter(
                "transactions_resent_total",
                "Pending transactions broadcast again after the timeout",
                &["signer"],
            )?,
            pending: core.new_int_gauge(
                "transactions_pending",
                "Transactions in the store waiting to be mined",
                &["signer"],
            )?,
        })
    }
}

impl Debug for TransactionManagerMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransactionManagerMetrics")
    }
}
