use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, U256};
use ethers::utils::rlp::Rlp;
use tracing::warn;

use relay_core::{abi::encode_relay_call, RelayTransactionRequest};

use crate::RelayClientError;

/// Check that the transaction a relay returned is the `relayCall` that was
/// requested, signed by the request's relay worker.
///
/// Returns `Ok(false)` when the transaction is malformed or differs from the
/// request, and [`RelayClientError::NonceAboveMax`] when it is correct but
/// uses a nonce above the agreed maximum.
pub fn validate_relay_response(
    request: &RelayTransactionRequest,
    relay_hub: Address,
    max_acceptance_budget: U256,
    raw_tx: &Bytes,
) -> Result<bool, RelayClientError> {
    let (tx, signature) = match TypedTransaction::decode_signed(&Rlp::new(raw_tx)) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(%err, "Relay returned a transaction that does not decode");
            return Ok(false);
        }
    };

    if tx.to_addr() != Some(&relay_hub) {
        warn!(to = ?tx.to_addr(), ?relay_hub, "Relay transaction is not sent to the hub");
        return Ok(false);
    }

    let external_gas_limit = tx.gas().copied().unwrap_or_default();
    let expected_calldata = encode_relay_call(
        max_acceptance_budget,
        &request.relay_request,
        &request.metadata.signature,
        &request.metadata.approval_data,
        external_gas_limit,
    );
    if tx.data() != Some(&expected_calldata) {
        warn!("Relay transaction calldata differs from the requested relayCall");
        return Ok(false);
    }

    let relay_worker = request.relay_request.relay_data.relay_worker;
    match signature.recover(tx.sighash()) {
        Ok(signer) if signer == relay_worker => {}
        Ok(signer) => {
            warn!(?signer, ?relay_worker, "Relay transaction is not signed by the relay worker");
            return Ok(false);
        }
        Err(err) => {
            warn!(%err, "Cannot recover relay transaction signer");
            return Ok(false);
        }
    }

    let nonce = tx.nonce().copied().unwrap_or_default();
    let max_nonce = request.metadata.relay_max_nonce;
    if nonce > U256::from(max_nonce) {
        return Err(RelayClientError::NonceAboveMax { nonce, max_nonce });
    }
    Ok(true)
}

#[cfg(test)]
pub(crate) mod tests {
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::TransactionRequest;

    use relay_core::{ForwardRequest, RelayData, RelayMetadata, RelayRequest};

    use super::*;

    pub(crate) const HUB: Address = Address::repeat_byte(0xaa);
    pub(crate) const BUDGET: u64 = 285_252;

    pub(crate) fn relay_request(worker: Address) -> RelayTransactionRequest {
        RelayTransactionRequest {
            relay_request: RelayRequest {
                request: ForwardRequest {
                    from: Address::repeat_byte(0x11),
                    to: Address::repeat_byte(0x22),
                    value: U256::zero(),
                    gas: U256::from(100_000),
                    nonce: U256::from(3),
                    data: Bytes::from(vec![0xca, 0xfe]),
                },
                relay_data: RelayData {
                    gas_price: U256::from(12),
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
                signature: Bytes::from(vec![7; 65]),
                approval_data: Bytes::default(),
                relay_hub_address: HUB,
                relay_max_nonce: 10,
            },
        }
    }

    /// What an honest relay would return, with knobs to make it dishonest.
    pub(crate) fn relay_tx(
        wallet: &LocalWallet,
        request: &RelayTransactionRequest,
        to: Address,
        nonce: u64,
    ) -> Bytes {
        let gas = U256::from(500_000);
        let data = encode_relay_call(
            U256::from(BUDGET),
            &request.relay_request,
            &request.metadata.signature,
            &request.metadata.approval_data,
            gas,
        );
        let tx: TypedTransaction = TransactionRequest::new()
            .to(to)
            .data(data)
            .gas(gas)
            .gas_price(request.relay_request.relay_data.gas_price)
            .nonce(nonce)
            .chain_id(wallet.chain_id())
            .into();
        let signature = wallet.sign_transaction_sync(&tx).unwrap();
        tx.rlp_signed(&signature)
    }

    fn wallet() -> LocalWallet {
        LocalWallet::new(&mut ethers::core::rand::thread_rng()).with_chain_id(1337u64)
    }

    #[test]
    fn accepts_honest_transaction() {
        let worker = wallet();
        let request = relay_request(worker.address());
        let raw = relay_tx(&worker, &request, HUB, 10);
        assert!(validate_relay_response(&request, HUB, U256::from(BUDGET), &raw).unwrap());
    }

    #[test]
    fn rejects_wrong_destination() {
        let worker = wallet();
        let request = relay_request(worker.address());
        let raw = relay_tx(&worker, &request, Address::repeat_byte(0xee), 1);
        assert!(!validate_relay_response(&request, HUB, U256::from(BUDGET), &raw).unwrap());
    }

    #[test]
    fn rejects_wrong_signer() {
        let worker = wallet();
        let request = relay_request(worker.address());
        let raw = relay_tx(&wallet(), &request, HUB, 1);
        assert!(!validate_relay_response(&request, HUB, U256::from(BUDGET), &raw).unwrap());
    }

    #[test]
    fn rejects_nonce_above_max() {
        let worker = wallet();
        let request = relay_request(worker.address());
        let raw = relay_tx(&worker, &request, HUB, 11);
        let err = validate_relay_response(&request, HUB, U256::from(BUDGET), &raw).unwrap_err();
        assert!(matches!(
            err,
            RelayClientError::NonceAboveMax { max_nonce: 10, .. }
        ));
    }

    #[test]
    fn rejects_different_calldata() {
        let worker = wallet();
        let request = relay_request(worker.address());
        let raw = relay_tx(&worker, &request, HUB, 1);
        // relay claims a different acceptance budget than the client expects
        assert!(!validate_relay_response(&request, HUB, U256::from(BUDGET + 1), &raw).unwrap());
    }

    #[test]
    fn rejects_garbage_without_panicking() {
        let request = relay_request(Address::repeat_byte(1));
        for raw in [Bytes::default(), Bytes::from(vec![0xf8, 0x01, 0x02])] {
            assert!(!validate_relay_response(&request, HUB, U256::from(BUDGET), &raw).unwrap());
        }
    }
}
