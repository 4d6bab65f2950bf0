use std::collections::HashMap;

use ethers::types::Address;
use itertools::Itertools;

use relay_core::{RelayCandidate, RelayHubEvent, RelayHubEventKind};

/// Fold hub events into the set of currently registered relays.
///
/// Events are stable-sorted by `(block_number, transaction_index)` and applied
/// in order: a registration inserts (or replaces) the manager's entry, an exit
/// event removes it. Events that are neither are ignored. The result is
/// ordered by registration position.
pub fn merge_relay_events(events: impl IntoIterator<Item = RelayHubEvent>) -> Vec<RelayCandidate> {
    let mut relays: HashMap<Address, RelayCandidate> = HashMap::new();
    for event in events.into_iter().sorted_by_key(RelayHubEvent::position) {
        let position = event.position();
        match event.kind {
            RelayHubEventKind::Registered {
                relay_url,
                pct_relay_fee,
                base_relay_fee,
            } => {
                relays.insert(
                    event.relay_manager,
                    RelayCandidate {
                        relay_url,
                        relay_manager: event.relay_manager,
                        pct_relay_fee,
                        base_relay_fee,
                        registered_at_block: position.0,
                        registered_at_tx_index: position.1,
                    },
                );
            }
            RelayHubEventKind::Other(name) if name.is_exit() => {
                relays.remove(&event.relay_manager);
            }
            RelayHubEventKind::Other(_) => {}
        }
    }
    relays
        .into_values()
        .sorted_by_key(|relay| (relay.registered_at_block, relay.registered_at_tx_index))
        .collect()
}

#[cfg(test)]
mod tests {
    use ethers::types::U256;

    use relay_core::RelayEventName;

    use super::*;

    fn registered(manager: u8, block: u64, index: u64, url: &str) -> RelayHubEvent {
        RelayHubEvent {
            block_number: block,
            transaction_index: index,
            relay_manager: Address::repeat_byte(manager),
            kind: RelayHubEventKind::Registered {
                relay_url: url.into(),
                pct_relay_fee: U256::from(10),
                base_relay_fee: U256::zero(),
            },
        }
    }

    fn other(manager: u8, block: u64, index: u64, name: RelayEventName) -> RelayHubEvent {
        RelayHubEvent {
            block_number: block,
            transaction_index: index,
            relay_manager: Address::repeat_byte(manager),
            kind: RelayHubEventKind::Other(name),
        }
    }

    fn managers(relays: &[RelayCandidate]) -> Vec<Address> {
        relays.iter().map(|r| r.relay_manager).collect()
    }

    #[test]
    fn exit_after_registration_removes_manager() {
        let relays = merge_relay_events(vec![
            other(1, 10, 0, RelayEventName::StakeUnlocked),
            registered(1, 5, 0, "http://one"),
            registered(2, 6, 0, "http://two"),
        ]);
        assert_eq!(managers(&relays), vec![Address::repeat_byte(2)]);
    }

    #[test]
    fn registration_after_exit_restores_manager() {
        let relays = merge_relay_events(vec![
            registered(1, 5, 0, "http://old"),
            other(1, 6, 2, RelayEventName::HubUnauthorized),
            registered(1, 6, 3, "http://new"),
        ]);
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].relay_url, "http://new");
        assert_eq!(
            (relays[0].registered_at_block, relays[0].registered_at_tx_index),
            (6, 3)
        );
    }

    #[test]
    fn transaction_index_orders_events_within_a_block() {
        // penalized before re-registering in the same block
        let relays = merge_relay_events(vec![
            registered(1, 7, 4, "http://one"),
            other(1, 7, 1, RelayEventName::StakePenalized),
        ]);
        assert_eq!(managers(&relays), vec![Address::repeat_byte(1)]);

        // penalized after registering in the same block
        let relays = merge_relay_events(vec![
            registered(1, 7, 1, "http://one"),
            other(1, 7, 4, RelayEventName::StakePenalized),
        ]);
        assert!(relays.is_empty());
    }

    #[test]
    fn later_registration_supersedes_earlier_one() {
        let relays = merge_relay_events(vec![
            registered(1, 9, 0, "http://second"),
            registered(1, 3, 0, "http://first"),
        ]);
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].relay_url, "http://second");
    }

    #[test]
    fn activity_events_do_not_register_or_remove() {
        let relays = merge_relay_events(vec![
            other(1, 1, 0, RelayEventName::TransactionRelayed),
            registered(2, 2, 0, "http://two"),
            other(2, 3, 0, RelayEventName::RelayWorkersAdded),
        ]);
        assert_eq!(managers(&relays), vec![Address::repeat_byte(2)]);
    }
}
