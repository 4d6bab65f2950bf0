use std::sync::Mutex;

use ethers::signers::{LocalWallet, Signer};
use ethers::utils::keccak256;
use tempfile::TempDir;

use relay_client::validate_relay_response;
use relay_core::{
    test_utils::MockRelayChain, ForwardRequest, RelayCallSimulation, RelayData, RelayMetadata,
    RelayRequest, H256,
};

use super::*;
use crate::key_manager::KeyManager;
use crate::transaction_manager::{TransactionManagerConfig, TransactionManagerMetrics};
use crate::tx_store::{RocksTxStore, TxStore};

pub(crate) const HUB: Address = Address::repeat_byte(0xaa);
pub(crate) const CHAIN_ID: u64 = 1337;
pub(crate) const BUDGET: u64 = 285_252;
const GWEI: u64 = 1_000_000_000;

pub(crate) fn accepted() -> RelayCallSimulation {
    RelayCallSimulation {
        paymaster_accepted: true,
        reverted: false,
        return_value: Bytes::default(),
    }
}

fn rejected(reason: &str) -> RelayCallSimulation {
    let mut return_value = vec![0x08, 0xc3, 0x79, 0xa0];
    return_value.extend(ethers::abi::encode(&[ethers::abi::Token::String(
        reason.into(),
    )]));
    RelayCallSimulation {
        paymaster_accepted: false,
        reverted: false,
        return_value: return_value.into(),
    }
}

/// Network gas price is 10 gwei, the worker has sent 3 transactions
pub(crate) fn chain(
    simulation: RelayCallSimulation,
) -> (MockRelayChain, Arc<Mutex<Vec<Bytes>>>) {
    let mut chain = MockRelayChain::new();
    chain.expect_relay_hub_address().return_const(HUB);
    chain.expect_chain_id().return_const(CHAIN_ID);
    chain.expect_get_block_number().returning(|| Ok(100));
    chain
        .expect_get_gas_price()
        .returning(|| Ok(U256::from(10 * GWEI)));
    chain
        .expect_get_block_gas_limit()
        .returning(|| Ok(U256::from(10_000_000)));
    chain
        .expect_get_transaction_count()
        .returning(|_, _| Ok(U256::from(3)));
    chain
        .expect_simulate_relay_call()
        .returning(move |_, _, _, _| Ok(simulation.clone()));

    let broadcasts = Arc::new(Mutex::new(vec![]));
    let recorded = broadcasts.clone();
    chain.expect_broadcast_transaction().returning(move |raw| {
        let hash = H256(keccak256(&raw));
        recorded.lock().unwrap().push(raw);
        Ok(hash)
    });
    (chain, broadcasts)
}

pub(crate) struct Harness {
    _dir: TempDir,
    pub store: Arc<RocksTxStore>,
    pub server: Arc<RelayServer>,
    pub worker: Address,
    pub manager: Address,
    pub metrics: Arc<CoreMetrics>,
}

pub(crate) fn harness(chain: MockRelayChain) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RocksTxStore::open(&dir.path().join("txstore")).unwrap());
    let keys = KeyManager::from_wallets([
        (SignerRole::Manager, wallet()),
        (SignerRole::Worker(0), wallet()),
    ]);
    let metrics = Arc::new(CoreMetrics::dummy_instance());
    let chain: Arc<dyn RelayChain> = Arc::new(chain);
    let tx_manager = Arc::new(TransactionManager::new(
        chain.clone(),
        store.clone(),
        keys.transaction_signers(),
        TransactionManagerConfig::default(),
        TransactionManagerMetrics::new(&metrics).unwrap(),
    ));
    let config = RelayServerConfig {
        base_relay_fee: U256::zero(),
        pct_relay_fee: U256::from(10),
        gas_price_factor_percent: 20,
        min_gas_price: U256::from(GWEI),
        max_acceptance_budget: U256::from(BUDGET),
        relay_call_gas_overhead: U256::from(50_000),
    };
    let server = RelayServer::new(chain, tx_manager, config, metrics.clone()).unwrap();
    Harness {
        _dir: dir,
        store,
        worker: keys.address(SignerRole::Worker(0)).unwrap(),
        manager: keys.address(SignerRole::Manager).unwrap(),
        server: Arc::new(server),
        metrics,
    }
}

fn wallet() -> LocalWallet {
    LocalWallet::new(&mut ethers::core::rand::thread_rng()).with_chain_id(CHAIN_ID)
}

/// A request the relay accepts: 12 gwei matches the 20% markup
pub(crate) fn request(worker: Address) -> RelayTransactionRequest {
    RelayTransactionRequest {
        relay_request: RelayRequest {
            request: ForwardRequest {
                from: Address::repeat_byte(0x11),
                to: Address::repeat_byte(0x22),
                value: U256::zero(),
                gas: U256::from(100_000),
                nonce: U256::from(4),
                data: Bytes::from(vec![0xde, 0xad]),
            },
            relay_data: RelayData {
                gas_price: U256::from(12 * GWEI),
                pct_relay_fee: U256::from(10),
                base_relay_fee: U256::zero(),
                relay_worker: worker,
                paymaster: Address::repeat_byte(0x44),
                forwarder: Address::repeat_byte(0x55),
                paymaster_data: Bytes::default(),
                client_id: U256::one(),
            },
        },
        metadata: RelayMetadata {
            signature: Bytes::from(vec![0x1b; 65]),
            approval_data: Bytes::default(),
            relay_hub_address: HUB,
            relay_max_nonce: 5,
        },
    }
}

#[tokio::test]
async fn ping_reports_addresses_and_marked_up_gas_price() {
    let (chain, _) = chain(accepted());
    let h = harness(chain);

    let ping = h.server.ping(Some(Address::repeat_byte(0x44))).await.unwrap();
    assert_eq!(ping.relay_worker_address, h.worker);
    assert_eq!(ping.relay_manager_address, h.manager);
    assert_eq!(ping.relay_hub_address, HUB);
    assert_eq!(ping.min_gas_price, U256::from(12 * GWEI));
    assert_eq!(ping.max_acceptance_budget, U256::from(BUDGET));
    assert!(ping.ready);
    assert_eq!(ping.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn accepted_request_yields_a_transaction_the_client_trusts() {
    let (chain, broadcasts) = chain(accepted());
    let h = harness(chain);
    let request = request(h.worker);

    let raw_tx = h
        .server
        .create_relay_transaction(request.clone())
        .await
        .unwrap();

    assert!(validate_relay_response(&request, HUB, U256::from(BUDGET), &raw_tx).unwrap());
    assert_eq!(*broadcasts.lock().unwrap(), vec![raw_tx.clone()]);
    let stored = h.store.get_all().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].nonce, 3);
    assert_eq!(stored[0].gas_limit, U256::from(150_000));
    assert_eq!(stored[0].raw_tx, raw_tx);

    let report = String::from_utf8(h.metrics.gather().unwrap()).unwrap();
    assert!(report.contains("outcome=\"accepted\""));
}

#[tokio::test]
async fn invalid_requests_are_rejected_without_sending() {
    let (chain, broadcasts) = chain(accepted());
    let h = harness(chain);

    let mut wrong_hub = request(h.worker);
    wrong_hub.metadata.relay_hub_address = Address::repeat_byte(0xbb);
    let mut wrong_worker = request(h.worker);
    wrong_worker.relay_request.relay_data.relay_worker = Address::repeat_byte(0xcc);
    let mut cheap_gas = request(h.worker);
    cheap_gas.relay_request.relay_data.gas_price = U256::from(11 * GWEI);
    let mut low_fee = request(h.worker);
    low_fee.relay_request.relay_data.pct_relay_fee = U256::from(9);
    let mut too_much_gas = request(h.worker);
    too_much_gas.relay_request.request.gas = U256::from(9_960_000);
    let mut stale_nonce = request(h.worker);
    stale_nonce.metadata.relay_max_nonce = 2;

    for request in [
        wrong_hub,
        wrong_worker,
        cheap_gas,
        low_fee,
        too_much_gas,
        stale_nonce,
    ] {
        let err = h
            .server
            .create_relay_transaction(request)
            .await
            .unwrap_err();
        assert!(err.is_rejection(), "{err}");
    }

    assert!(broadcasts.lock().unwrap().is_empty());
    assert!(h.store.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn each_check_names_its_reason() {
    let (chain, _) = chain(accepted());
    let h = harness(chain);

    let mut req = request(h.worker);
    req.metadata.relay_hub_address = Address::repeat_byte(0xbb);
    assert!(matches!(
        h.server.create_relay_transaction(req).await,
        Err(RelayServerError::WrongHub { .. })
    ));

    let mut req = request(h.worker);
    req.relay_request.relay_data.gas_price = U256::from(11 * GWEI);
    assert!(matches!(
        h.server.create_relay_transaction(req).await,
        Err(RelayServerError::GasPriceTooLow { .. })
    ));

    let mut req = request(h.worker);
    req.relay_request.request.gas = U256::from(9_960_000);
    assert!(matches!(
        h.server.create_relay_transaction(req).await,
        Err(RelayServerError::GasLimitTooHigh { .. })
    ));

    let mut req = request(h.worker);
    req.metadata.relay_max_nonce = 2;
    assert!(matches!(
        h.server.create_relay_transaction(req).await,
        Err(RelayServerError::NonceAboveMax {
            nonce: 3,
            max_nonce: 2
        })
    ));
}

#[tokio::test]
async fn failed_dry_run_is_rejected_with_the_revert_reason() {
    let (chain, broadcasts) = chain(rejected("paymaster says no"));
    let h = harness(chain);

    let err = h
        .server
        .create_relay_transaction(request(h.worker))
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        RelayServerError::DryRunRejected(reason) if reason == "paymaster says no"
    ));
    assert!(broadcasts.lock().unwrap().is_empty());

    let report = String::from_utf8(h.metrics.gather().unwrap()).unwrap();
    assert!(report.contains("outcome=\"rejected\""));
}
