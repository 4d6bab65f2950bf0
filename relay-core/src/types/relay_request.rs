use std::convert::Infallible;

use ethers::abi::Token;
use ethers::types::transaction::eip712::{EIP712Domain, Eip712};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

const EIP_712_DOMAIN_NAME: &str = "GSN Relayed Transaction";
const EIP_712_VERSION: &str = "2";
const RELAY_DATA_TYPE: &str = concat!(
    "RelayData(uint256 gasPrice,uint256 pctRelayFee,uint256 baseRelayFee,",
    "address relayWorker,address paymaster,address forwarder,",
    "bytes paymasterData,uint256 clientId)"
);
const RELAY_REQUEST_TYPE: &str = concat!(
    "RelayRequest(address from,address to,uint256 value,uint256 gas,",
    "uint256 nonce,bytes data,RelayData relayData)"
);

/// The transaction intent of a relay request, as executed by the forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    /// The sender on whose behalf the call is made
    pub from: Address,
    /// The recipient contract
    pub to: Address,
    /// Value forwarded with the call
    pub value: U256,
    /// Gas limit for the inner call
    pub gas: U256,
    /// The sender's nonce in the forwarder
    pub nonce: U256,
    /// Calldata of the inner call
    pub data: Bytes,
}

/// The relay economics of a relay request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayData {
    /// Gas price the relay worker will pay
    pub gas_price: U256,
    /// Percentage fee on top of the gas cost
    pub pct_relay_fee: U256,
    /// Flat fee
    pub base_relay_fee: U256,
    /// The worker that signs the outer transaction
    pub relay_worker: Address,
    /// The paymaster sponsoring the call
    pub paymaster: Address,
    /// The forwarder verifying the signature
    pub forwarder: Address,
    /// Opaque data passed to the paymaster
    pub paymaster_data: Bytes,
    /// Identifier of the client software
    pub client_id: U256,
}

/// A meta-transaction: the transaction intent plus relay economics. Once a
/// request is signed it must not change; use [`RelayRequest::clone_with_overrides`]
/// to produce a fresh request for another relay.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    /// Transaction intent
    pub request: ForwardRequest,
    /// Relay economics
    pub relay_data: RelayData,
}

/// Fields that differ between attempts against different relays.
#[derive(Debug, Clone, Default)]
pub struct RelayRequestOverrides {
    /// Worker of the newly selected relay
    pub relay_worker: Option<Address>,
    /// Percentage fee of the newly selected relay
    pub pct_relay_fee: Option<U256>,
    /// Flat fee of the newly selected relay
    pub base_relay_fee: Option<U256>,
    /// Gas price for the new attempt
    pub gas_price: Option<U256>,
    /// Paymaster data for the new attempt
    pub paymaster_data: Option<Bytes>,
}

impl RelayRequest {
    /// Produce a new, unsigned request with the given fields replaced.
    pub fn clone_with_overrides(&self, overrides: RelayRequestOverrides) -> Self {
        let mut cloned = self.clone();
        let data = &mut cloned.relay_data;
        if let Some(relay_worker) = overrides.relay_worker {
            data.relay_worker = relay_worker;
        }
        if let Some(pct_relay_fee) = overrides.pct_relay_fee {
            data.pct_relay_fee = pct_relay_fee;
        }
        if let Some(base_relay_fee) = overrides.base_relay_fee {
            data.base_relay_fee = base_relay_fee;
        }
        if let Some(gas_price) = overrides.gas_price {
            data.gas_price = gas_price;
        }
        if let Some(paymaster_data) = overrides.paymaster_data {
            data.paymaster_data = paymaster_data;
        }
        cloned
    }

    /// The ABI token of this request, as passed to `relayCall`.
    pub fn to_token(&self) -> Token {
        let req = &self.request;
        let data = &self.relay_data;
        Token::Tuple(vec![
            Token::Tuple(vec![
                Token::Address(req.from),
                Token::Address(req.to),
                Token::Uint(req.value),
                Token::Uint(req.gas),
                Token::Uint(req.nonce),
                Token::Bytes(req.data.to_vec()),
            ]),
            Token::Tuple(vec![
                Token::Uint(data.gas_price),
                Token::Uint(data.pct_relay_fee),
                Token::Uint(data.base_relay_fee),
                Token::Address(data.relay_worker),
                Token::Address(data.paymaster),
                Token::Address(data.forwarder),
                Token::Bytes(data.paymaster_data.to_vec()),
                Token::Uint(data.client_id),
            ]),
        ])
    }

    /// Bind the request to a chain so it can be signed as EIP-712 typed data.
    pub fn typed(&self, chain_id: u64) -> TypedRelayRequest {
        TypedRelayRequest {
            request: self.clone(),
            chain_id,
        }
    }
}

/// A relay request bound to a chain id, signable as EIP-712 typed data with
/// the forwarder as verifying contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedRelayRequest {
    /// The request being signed
    pub request: RelayRequest,
    /// Chain the forwarder lives on
    pub chain_id: u64,
}

impl TypedRelayRequest {
    fn relay_data_hash(&self) -> [u8; 32] {
        let data = &self.request.relay_data;
        keccak256(ethers::abi::encode(&[
            Token::FixedBytes(keccak256(RELAY_DATA_TYPE).to_vec()),
            Token::Uint(data.gas_price),
            Token::Uint(data.pct_relay_fee),
            Token::Uint(data.base_relay_fee),
            Token::Address(data.relay_worker),
            Token::Address(data.paymaster),
            Token::Address(data.forwarder),
            Token::FixedBytes(keccak256(&data.paymaster_data).to_vec()),
            Token::Uint(data.client_id),
        ]))
    }
}

impl Eip712 for TypedRelayRequest {
    type Error = Infallible;

    fn domain(&self) -> Result<EIP712Domain, Self::Error> {
        Ok(EIP712Domain {
            name: Some(EIP_712_DOMAIN_NAME.to_owned()),
            version: Some(EIP_712_VERSION.to_owned()),
            chain_id: Some(self.chain_id.into()),
            verifying_contract: Some(self.request.relay_data.forwarder),
            salt: None,
        })
    }

    fn type_hash() -> Result<[u8; 32], Self::Error> {
        // referenced struct types are appended to the primary type
        Ok(keccak256(format!("{RELAY_REQUEST_TYPE}{RELAY_DATA_TYPE}")))
    }

    fn struct_hash(&self) -> Result<[u8; 32], Self::Error> {
        let req = &self.request.request;
        Ok(keccak256(ethers::abi::encode(&[
            Token::FixedBytes(Self::type_hash()?.to_vec()),
            Token::Address(req.from),
            Token::Address(req.to),
            Token::Uint(req.value),
            Token::Uint(req.gas),
            Token::Uint(req.nonce),
            Token::FixedBytes(keccak256(&req.data).to_vec()),
            Token::FixedBytes(self.relay_data_hash().to_vec()),
        ])))
    }
}
