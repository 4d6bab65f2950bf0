use std::fmt;

use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;

/// Hub and stake manager events the relay pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayEventName {
    /// A relay manager registered (or re-registered) a relay URL and fees
    RelayServerRegistered,
    /// A relay manager added workers
    RelayWorkersAdded,
    /// A worker relayed a transaction
    TransactionRelayed,
    /// A paymaster rejected a relayed transaction
    TransactionRejectedByPaymaster,
    /// The manager's stake was unlocked
    StakeUnlocked,
    /// The manager deauthorized the hub
    HubUnauthorized,
    /// The manager's stake was slashed
    StakePenalized,
}

impl RelayEventName {
    /// Events that show a manager has been active on the hub recently.
    pub const ACTIVE_MANAGER_EVENTS: [RelayEventName; 4] = [
        RelayEventName::RelayServerRegistered,
        RelayEventName::RelayWorkersAdded,
        RelayEventName::TransactionRelayed,
        RelayEventName::TransactionRejectedByPaymaster,
    ];

    /// Events after which a manager should no longer be used.
    pub const EXIT_EVENTS: [RelayEventName; 3] = [
        RelayEventName::StakeUnlocked,
        RelayEventName::HubUnauthorized,
        RelayEventName::StakePenalized,
    ];

    /// All events the pipeline knows how to decode
    pub const ALL: [RelayEventName; 7] = [
        RelayEventName::RelayServerRegistered,
        RelayEventName::RelayWorkersAdded,
        RelayEventName::TransactionRelayed,
        RelayEventName::TransactionRejectedByPaymaster,
        RelayEventName::StakeUnlocked,
        RelayEventName::HubUnauthorized,
        RelayEventName::StakePenalized,
    ];

    /// Solidity event signature
    pub fn signature(&self) -> &'static str {
        match self {
            RelayEventName::RelayServerRegistered => {
                "RelayServerRegistered(address,uint256,uint256,string)"
            }
            RelayEventName::RelayWorkersAdded => "RelayWorkersAdded(address,address[],uint256)",
            RelayEventName::TransactionRelayed => {
                "TransactionRelayed(address,address,address,address,address,bytes4,uint8,uint256)"
            }
            RelayEventName::TransactionRejectedByPaymaster => {
                "TransactionRejectedByPaymaster(address,address,address,address,address,bytes4,uint256,bytes)"
            }
            RelayEventName::StakeUnlocked => "StakeUnlocked(address,address,uint256)",
            RelayEventName::HubUnauthorized => "HubUnauthorized(address,address,uint256)",
            RelayEventName::StakePenalized => "StakePenalized(address,address,uint256)",
        }
    }

    /// The first log topic of this event
    pub fn topic(&self) -> H256 {
        H256::from(keccak256(self.signature()))
    }

    /// Look an event up by its first log topic
    pub fn from_topic(topic: &H256) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.topic() == *topic)
    }

    /// Whether this event removes the manager from the candidate set
    pub fn is_exit(&self) -> bool {
        Self::EXIT_EVENTS.contains(self)
    }
}

impl fmt::Display for RelayEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The decoded body of a hub event. Only registrations carry data the
/// pipeline needs; everything else is identified by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayHubEventKind {
    /// `RelayServerRegistered`
    Registered {
        /// Relay URL
        relay_url: String,
        /// Percentage fee
        pct_relay_fee: U256,
        /// Flat fee
        base_relay_fee: U256,
    },
    /// Any other event
    Other(RelayEventName),
}

impl RelayHubEventKind {
    /// Name of the event
    pub fn name(&self) -> RelayEventName {
        match self {
            RelayHubEventKind::Registered { .. } => RelayEventName::RelayServerRegistered,
            RelayHubEventKind::Other(name) => *name,
        }
    }
}

/// A hub or stake manager event, positioned in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHubEvent {
    /// Block the event was emitted in
    pub block_number: u64,
    /// Index of the emitting transaction within the block
    pub transaction_index: u64,
    /// The indexed relay manager of the event
    pub relay_manager: Address,
    /// Decoded event body
    pub kind: RelayHubEventKind,
}

impl RelayHubEvent {
    /// Ordering key of the event within the chain
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.transaction_index)
    }
}
