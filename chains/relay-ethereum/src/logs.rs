use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Filter, Log, H256};
use tracing::warn;

use relay_core::{RelayEventName, RelayHubEvent, RelayHubEventKind};

/// Substring of the node error returned when an `eth_getLogs` range holds
/// more results than the node is willing to return.
pub const TOO_MANY_RESULTS_MESSAGE: &str = "query returned more than";

/// Build a log filter over the hub and stake manager for the given events,
/// restricted to `relay_managers` in the first indexed topic when non-empty.
pub fn relay_events_filter(
    emitters: Vec<Address>,
    names: &[RelayEventName],
    relay_managers: &[Address],
    from_block: u64,
    to_block: u64,
) -> Filter {
    let filter = Filter::new()
        .address(emitters)
        .topic0(names.iter().map(RelayEventName::topic).collect::<Vec<_>>())
        .from_block(from_block)
        .to_block(to_block);
    if relay_managers.is_empty() {
        filter
    } else {
        filter.topic1(
            relay_managers
                .iter()
                .map(|manager| H256::from(*manager))
                .collect::<Vec<_>>(),
        )
    }
}

/// Decode a hub or stake manager log. Logs of unknown events, or pending logs
/// without a position, yield `None`.
pub fn parse_relay_event(log: &Log) -> Option<RelayHubEvent> {
    let name = RelayEventName::from_topic(log.topics.first()?)?;
    let relay_manager = Address::from(*log.topics.get(1)?);
    let block_number = log.block_number?.as_u64();
    let transaction_index = log.transaction_index?.as_u64();

    let kind = match name {
        RelayEventName::RelayServerRegistered => match decode_registration(&log.data) {
            Some(kind) => kind,
            None => {
                warn!(?relay_manager, block_number, "Undecodable relay registration event");
                return None;
            }
        },
        other => RelayHubEventKind::Other(other),
    };

    Some(RelayHubEvent {
        block_number,
        transaction_index,
        relay_manager,
        kind,
    })
}

/// `RelayServerRegistered(address indexed relayManager, uint256 baseRelayFee,
/// uint256 pctRelayFee, string relayUrl)`
fn decode_registration(data: &[u8]) -> Option<RelayHubEventKind> {
    let tokens = abi::decode(
        &[ParamType::Uint(256), ParamType::Uint(256), ParamType::String],
        data,
    )
    .ok()?;
    match tokens.as_slice() {
        [Token::Uint(base_relay_fee), Token::Uint(pct_relay_fee), Token::String(relay_url)] => {
            Some(RelayHubEventKind::Registered {
                relay_url: relay_url.clone(),
                pct_relay_fee: *pct_relay_fee,
                base_relay_fee: *base_relay_fee,
            })
        }
        _ => None,
    }
}
