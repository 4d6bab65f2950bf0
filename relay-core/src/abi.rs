use ethers::abi::{self, ParamType, Token};
use ethers::types::{Bytes, U256};

use crate::RelayRequest;

/// Selector of `Error(string)`
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// Selector of `Panic(uint256)`
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

fn forward_request_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Bytes,
    ])
}

fn relay_data_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Address,
        ParamType::Address,
        ParamType::Address,
        ParamType::Bytes,
        ParamType::Uint(256),
    ])
}

/// Parameters of `relayCall(uint256 maxAcceptanceBudget, RelayRequest relayRequest,
/// bytes signature, bytes approvalData, uint256 externalGasLimit)`
pub fn relay_call_params() -> Vec<ParamType> {
    vec![
        ParamType::Uint(256),
        ParamType::Tuple(vec![forward_request_type(), relay_data_type()]),
        ParamType::Bytes,
        ParamType::Bytes,
        ParamType::Uint(256),
    ]
}

/// Encode a call to `name` with the given parameter types and arguments.
pub fn encode_call(name: &str, params: &[ParamType], args: &[Token]) -> Bytes {
    let mut calldata = abi::short_signature(name, params).to_vec();
    calldata.extend(abi::encode(args));
    calldata.into()
}

/// Encode the hub's `relayCall` for a signed request. Relay servers and
/// clients must produce byte-identical calldata for the same arguments.
pub fn encode_relay_call(
    max_acceptance_budget: U256,
    relay_request: &RelayRequest,
    signature: &Bytes,
    approval_data: &Bytes,
    external_gas_limit: U256,
) -> Bytes {
    encode_call(
        "relayCall",
        &relay_call_params(),
        &[
            Token::Uint(max_acceptance_budget),
            relay_request.to_token(),
            Token::Bytes(signature.to_vec()),
            Token::Bytes(approval_data.to_vec()),
            Token::Uint(external_gas_limit),
        ],
    )
}

/// Decode the `(bool paymasterAccepted, bytes returnValue)` output of `relayCall`.
pub fn decode_relay_call_output(output: &[u8]) -> Result<(bool, Bytes), abi::Error> {
    let mut tokens = abi::decode(&[ParamType::Bool, ParamType::Bytes], output)?.into_iter();
    match (tokens.next(), tokens.next()) {
        (Some(Token::Bool(accepted)), Some(Token::Bytes(return_value))) => {
            Ok((accepted, return_value.into()))
        }
        _ => Err(abi::Error::InvalidData),
    }
}

/// Decode a human readable reason from revert data, if it has one.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    if data.len() < 4 {
        return None;
    }
    let (selector, payload) = data.split_at(4);
    if selector == ERROR_STRING_SELECTOR {
        match abi::decode(&[ParamType::String], payload).ok()?.pop()? {
            Token::String(reason) => Some(reason),
            _ => None,
        }
    } else if selector == PANIC_SELECTOR {
        match abi::decode(&[ParamType::Uint(256)], payload).ok()?.pop()? {
            Token::Uint(code) => Some(format!("panic code {code:#x}")),
            _ => None,
        }
    } else {
        None
    }
}
