use std::sync::Mutex;

use ethers::signers::{LocalWallet, Signer};
use tracing_test::traced_test;

use relay_core::{
    test_utils::MockRelayChain, ChainCommunicationError, PingResponse, RelayCallSimulation,
    RelayEventName, RelayHubEvent, RelayHubEventKind,
};

use super::*;
use crate::validator::tests::{relay_tx, BUDGET, HUB};
use crate::{AcceptAllFilter, AccountManager, DefaultRelayScore};

const CHAIN_ID: u64 = 1337;
const FORWARDER: Address = Address::repeat_byte(0x55);
const RECIPIENT: Address = Address::repeat_byte(0x22);

/// How a fake relay behaves when asked to relay
#[derive(Debug, Clone)]
enum Behavior {
    Honest,
    Timeout,
    WrongDestination,
    Reject(&'static str),
}

#[derive(Debug)]
struct FakeRelay {
    worker: LocalWallet,
    behavior: Behavior,
}

#[derive(Debug, Default)]
struct FakeRelays {
    relays: HashMap<String, FakeRelay>,
    submitted: Mutex<Vec<String>>,
}

impl FakeRelays {
    fn with(mut self, n: u8, behavior: Behavior) -> Self {
        let worker =
            LocalWallet::new(&mut ethers::core::rand::thread_rng()).with_chain_id(CHAIN_ID);
        self.relays
            .insert(relay_url(n), FakeRelay { worker, behavior });
        self
    }

    fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayHttpClient for FakeRelays {
    async fn get_ping_response(
        &self,
        relay_url: &str,
        _paymaster: Option<Address>,
    ) -> Result<PingResponse, RelayClientError> {
        let relay = self.relays.get(relay_url).ok_or(RelayClientError::Timeout {
            url: relay_url.to_owned(),
        })?;
        let n = relay_url.trim_start_matches("http://relay-").parse::<u8>().unwrap();
        Ok(PingResponse {
            relay_worker_address: relay.worker.address(),
            relay_manager_address: Address::repeat_byte(n),
            relay_hub_address: HUB,
            min_gas_price: U256::from(1),
            max_acceptance_budget: U256::from(BUDGET),
            ready: true,
            version: "2.2.0".into(),
        })
    }

    async fn relay_transaction(
        &self,
        relay_url: &str,
        request: &RelayTransactionRequest,
    ) -> Result<Bytes, RelayClientError> {
        self.submitted.lock().unwrap().push(relay_url.to_owned());
        let relay = &self.relays[relay_url];
        match relay.behavior {
            Behavior::Honest => Ok(relay_tx(&relay.worker, request, HUB, 8)),
            Behavior::WrongDestination => Ok(relay_tx(
                &relay.worker,
                request,
                Address::repeat_byte(0xee),
                8,
            )),
            Behavior::Timeout => Err(RelayClientError::Timeout {
                url: relay_url.to_owned(),
            }),
            Behavior::Reject(reason) => Err(RelayClientError::Rejected {
                url: relay_url.to_owned(),
                reason: reason.into(),
            }),
        }
    }
}

fn relay_url(n: u8) -> String {
    format!("http://relay-{n}")
}

fn event(n: u8, kind: RelayHubEventKind) -> RelayHubEvent {
    RelayHubEvent {
        block_number: 100 + n as u64,
        transaction_index: 0,
        relay_manager: Address::repeat_byte(n),
        kind,
    }
}

/// A chain where relays 1, 2 and 3 are registered with fees 10%, 5% and 1%
fn chain() -> MockRelayChain {
    let mut chain = MockRelayChain::new();
    chain.expect_relay_hub_address().return_const(HUB);
    chain.expect_chain_id().return_const(CHAIN_ID);
    chain.expect_get_block_number().returning(|| Ok(1_000));
    chain
        .expect_get_past_events()
        .returning(|_, managers, _, _| {
            let fees: [(u8, u64); 3] = [(1, 10), (2, 5), (3, 1)];
            if managers.is_empty() {
                let relayed = RelayHubEventKind::Other(RelayEventName::TransactionRelayed);
                return Ok(fees.iter().map(|(n, _)| event(*n, relayed.clone())).collect());
            }
            Ok(fees
                .iter()
                .map(|(n, pct)| {
                    event(
                        *n,
                        RelayHubEventKind::Registered {
                            relay_url: relay_url(*n),
                            pct_relay_fee: U256::from(*pct),
                            base_relay_fee: U256::zero(),
                        },
                    )
                })
                .collect())
        });
    chain.expect_get_gas_price().returning(|| Ok(U256::from(10)));
    chain
        .expect_estimate_gas()
        .returning(|_| Ok(U256::from(100_000)));
    chain
        .expect_get_trusted_forwarder()
        .returning(|_| Ok(Some(FORWARDER)));
    chain
        .expect_get_sender_nonce()
        .returning(|_, _| Ok(U256::from(3)));
    chain
        .expect_get_transaction_count()
        .returning(|_, _| Ok(U256::from(7)));
    chain
        .expect_get_block_gas_limit()
        .returning(|| Ok(U256::from(30_000_000)));
    chain.expect_simulate_relay_call().returning(|_, _, _, _| {
        Ok(RelayCallSimulation {
            paymaster_accepted: true,
            reverted: false,
            return_value: Bytes::default(),
        })
    });
    chain
}

struct Harness {
    client: RelayClient,
    http: Arc<FakeRelays>,
    sender: Address,
}

fn harness(chain: MockRelayChain, http: FakeRelays) -> Harness {
    let chain: Arc<dyn RelayChain> = Arc::new(chain);
    // one relay per slice keeps the selection order deterministic
    let config = RelayClientConfig {
        slice_size: 1,
        ..Default::default()
    };
    let known_relays = Arc::new(KnownRelaysManager::new(
        chain.clone(),
        config.clone(),
        Arc::new(AcceptAllFilter),
        Arc::new(DefaultRelayScore::deterministic()),
    ));
    let mut accounts = AccountManager::new();
    let sender = accounts.new_account();
    let http = Arc::new(http);
    let client = RelayClient::new(
        chain,
        config,
        known_relays,
        http.clone(),
        Arc::new(accounts),
        Arc::new(CoreMetrics::dummy_instance()),
    );
    Harness {
        client,
        http,
        sender,
    }
}

fn details(sender: Address) -> TransactionDetails {
    TransactionDetails {
        from: sender,
        to: RECIPIENT,
        data: Bytes::from(vec![0xca, 0xfe]),
        ..Default::default()
    }
}

#[tokio::test]
async fn cheapest_relay_is_used_first() {
    let mut chain = chain();
    chain
        .expect_broadcast_transaction()
        .times(1)
        .returning(|raw| Ok(H256::from(keccak256(&raw))));
    let http = FakeRelays::default()
        .with(1, Behavior::Honest)
        .with(2, Behavior::Honest)
        .with(3, Behavior::Honest);
    let h = harness(chain, http);

    let result = h.client.relay_transaction(details(h.sender)).await.unwrap();

    let transaction = result.transaction.unwrap();
    assert_eq!(transaction.relay_url, relay_url(3));
    assert_eq!(transaction.tx_hash, H256::from(keccak256(&transaction.raw_tx)));
    assert_eq!(h.http.submitted(), vec![relay_url(3)]);
    assert!(result.relaying_errors.is_empty());
}

#[tokio::test]
async fn timed_out_relay_is_recorded_and_next_relay_used() {
    let mut chain = chain();
    chain
        .expect_broadcast_transaction()
        .times(1)
        .returning(|raw| Ok(H256::from(keccak256(&raw))));
    let http = FakeRelays::default()
        .with(1, Behavior::Honest)
        .with(2, Behavior::Honest)
        .with(3, Behavior::Timeout);
    let h = harness(chain, http);

    let result = h.client.relay_transaction(details(h.sender)).await.unwrap();

    assert_eq!(result.transaction.unwrap().relay_url, relay_url(2));
    assert_eq!(h.http.submitted(), vec![relay_url(3), relay_url(2)]);
    assert!(matches!(
        result.relaying_errors.get(&relay_url(3)),
        Some(RelayClientError::Timeout { .. })
    ));
    let failures = h.client.known_relays().relay_failures(&relay_url(3)).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].relay_manager, Some(Address::repeat_byte(3)));
    assert!(h
        .client
        .known_relays()
        .relay_failures(&relay_url(2))
        .await
        .is_empty());
}

#[tokio::test]
async fn invalid_response_is_never_broadcast() {
    let broadcast = Arc::new(Mutex::new(vec![]));
    let broadcast_clone = broadcast.clone();
    let mut chain = chain();
    chain.expect_broadcast_transaction().returning(move |raw| {
        broadcast_clone.lock().unwrap().push(raw.clone());
        Ok(H256::from(keccak256(&raw)))
    });
    let http = FakeRelays::default()
        .with(1, Behavior::Honest)
        .with(2, Behavior::Honest)
        .with(3, Behavior::WrongDestination);
    let h = harness(chain, http);

    let result = h.client.relay_transaction(details(h.sender)).await.unwrap();

    let transaction = result.transaction.unwrap();
    assert_eq!(transaction.relay_url, relay_url(2));
    assert_eq!(*broadcast.lock().unwrap(), vec![transaction.raw_tx]);
    assert!(matches!(
        result.relaying_errors.get(&relay_url(3)),
        Some(RelayClientError::ValidationFailed)
    ));
    assert_eq!(
        h.client
            .known_relays()
            .relay_failures(&relay_url(3))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn structured_rejection_is_not_penalized() {
    let mut chain = chain();
    chain
        .expect_broadcast_transaction()
        .returning(|raw| Ok(H256::from(keccak256(&raw))));
    let http = FakeRelays::default()
        .with(2, Behavior::Honest)
        .with(3, Behavior::Reject("paymaster balance too low"));
    let h = harness(chain, http);

    let result = h.client.relay_transaction(details(h.sender)).await.unwrap();

    assert_eq!(result.transaction.unwrap().relay_url, relay_url(2));
    assert!(matches!(
        result.relaying_errors.get(&relay_url(3)),
        Some(RelayClientError::Rejected { .. })
    ));
    assert!(h
        .client
        .known_relays()
        .relay_failures(&relay_url(3))
        .await
        .is_empty());
    // relay 1 is never reached
    assert!(result.ping_errors.is_empty());
}

#[tokio::test]
async fn nothing_reachable_is_distinguished_from_rejected() {
    let h = harness(chain(), FakeRelays::default());
    let result = h.client.relay_transaction(details(h.sender)).await.unwrap();
    assert!(result.transaction.is_none());
    assert!(result.is_nothing_reachable());
    assert_eq!(result.ping_errors.len(), 3);

    let http = FakeRelays::default()
        .with(1, Behavior::Reject("no"))
        .with(2, Behavior::Reject("no"))
        .with(3, Behavior::Reject("no"));
    let h = harness(chain(), http);
    let result = h.client.relay_transaction(details(h.sender)).await.unwrap();
    assert!(result.transaction.is_none());
    assert!(!result.is_nothing_reachable());
    assert_eq!(result.relaying_errors.len(), 3);
}

#[tokio::test]
async fn paymaster_rejection_moves_to_next_relay_without_submitting() {
    let mut chain = MockRelayChain::new();
    chain.expect_relay_hub_address().return_const(HUB);
    chain.expect_chain_id().return_const(CHAIN_ID);
    chain.expect_get_block_number().returning(|| Ok(1_000));
    chain
        .expect_get_past_events()
        .returning(|_, managers, _, _| {
            if managers.is_empty() {
                Ok(vec![event(
                    3,
                    RelayHubEventKind::Other(RelayEventName::TransactionRelayed),
                )])
            } else {
                Ok(vec![event(
                    3,
                    RelayHubEventKind::Registered {
                        relay_url: relay_url(3),
                        pct_relay_fee: U256::from(1),
                        base_relay_fee: U256::zero(),
                    },
                )])
            }
        });
    chain.expect_get_trusted_forwarder().returning(|_| Ok(Some(FORWARDER)));
    chain
        .expect_get_sender_nonce()
        .returning(|_, _| Ok(U256::zero()));
    chain
        .expect_get_transaction_count()
        .returning(|_, _| Ok(U256::zero()));
    chain
        .expect_get_block_gas_limit()
        .returning(|| Ok(U256::from(30_000_000)));
    chain.expect_simulate_relay_call().returning(|_, _, _, _| {
        // Error("paymaster says no")
        let mut reason = vec![0x08, 0xc3, 0x79, 0xa0];
        reason.extend(ethers::abi::encode(&[ethers::abi::Token::String(
            "paymaster says no".into(),
        )]));
        Ok(RelayCallSimulation {
            paymaster_accepted: false,
            reverted: false,
            return_value: reason.into(),
        })
    });
    chain.expect_broadcast_transaction().never();
    let h = harness(chain, FakeRelays::default().with(3, Behavior::Honest));

    let mut details = details(h.sender);
    details.gas = Some(U256::from(50_000));
    details.gas_price = Some(U256::from(5));
    let result = h.client.relay_transaction(details).await.unwrap();

    assert!(result.transaction.is_none());
    assert!(h.http.submitted().is_empty());
    assert!(matches!(
        result.relaying_errors.get(&relay_url(3)),
        Some(RelayClientError::PaymasterRejected(reason)) if reason == "paymaster says no"
    ));
}

#[tokio::test]
#[traced_test]
async fn benign_broadcast_error_does_not_fail_relaying() {
    let mut chain = chain();
    chain
        .expect_broadcast_transaction()
        .returning(|_| Err(ChainCommunicationError::from_other_str("already known")));
    let h = harness(chain, FakeRelays::default().with(3, Behavior::Honest));

    let result = h.client.relay_transaction(details(h.sender)).await.unwrap();
    assert!(result.transaction.is_some());
    assert!(logs_contain("already known to the node"));
}

#[tokio::test]
async fn gas_price_is_marked_up_and_floored() {
    let h = harness(chain(), FakeRelays::default());
    // 10 * 120%
    assert_eq!(h.client.calculate_gas_price().await.unwrap(), U256::from(12));

    let mut h = harness(chain(), FakeRelays::default());
    h.client.config.min_gas_price = 50;
    assert_eq!(h.client.calculate_gas_price().await.unwrap(), U256::from(50));
}

#[tokio::test]
#[traced_test]
async fn forwarder_resolution() {
    // explicit forwarder untrusted by a deployed recipient
    let mut chain = MockRelayChain::new();
    chain.expect_is_contract_deployed().returning(|_| Ok(true));
    chain
        .expect_is_trusted_forwarder()
        .returning(|_, _| Ok(false));
    chain.expect_relay_hub_address().return_const(HUB);
    let h = harness(chain, FakeRelays::default());
    let mut explicit = details(h.sender);
    explicit.forwarder = Some(Address::repeat_byte(0x66));
    assert!(matches!(
        h.client.resolve_forwarder(&explicit).await,
        Err(RelayClientError::UntrustedForwarder { .. })
    ));

    // explicit forwarder with a recipient that is not deployed yet
    let mut chain = MockRelayChain::new();
    chain.expect_is_contract_deployed().returning(|_| Ok(false));
    chain.expect_is_trusted_forwarder().never();
    chain.expect_relay_hub_address().return_const(HUB);
    let h = harness(chain, FakeRelays::default());
    assert_eq!(
        h.client.resolve_forwarder(&explicit).await.unwrap(),
        Address::repeat_byte(0x66)
    );
    assert!(logs_contain("Recipient is not deployed"));

    // no forwarder anywhere
    let mut chain = MockRelayChain::new();
    chain.expect_get_trusted_forwarder().returning(|_| Ok(None));
    chain.expect_relay_hub_address().return_const(HUB);
    let h = harness(chain, FakeRelays::default());
    assert!(matches!(
        h.client.resolve_forwarder(&details(h.sender)).await,
        Err(RelayClientError::NoForwarder)
    ));
}

#[tokio::test]
async fn missing_sender_key_aborts() {
    let mut chain = chain();
    chain.expect_broadcast_transaction().never();
    let h = harness(chain, FakeRelays::default().with(3, Behavior::Honest));
    let err = h
        .client
        .relay_transaction(details(Address::repeat_byte(0x77)))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayClientError::MissingSigner(_)));
}
