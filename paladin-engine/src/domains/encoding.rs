//! Pure data encoding for domain callbacks.
//!
//! Supports the four encoding kinds domains request:
//!
//! - `FUNCTION_CALL_DATA` - selector-prefixed ABI call data from an ABI
//!   entry and a JSON body
//! - `TUPLE` - headless ABI encoding of a tuple parameter
//! - `ETH_TRANSACTION` - the EIP-1559 (default) or EIP-155 signing payload
//! - `TYPED_DATA_V4` - the EIP-712 v4 signing hash
//!
//! Signature recovery supports `ecdsa:secp256k1` over `opaque:rsv`.

use alloy::consensus::{SignableTransaction, TxEip1559, TxLegacy};
use alloy::dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, TypedData};
use alloy::json_abi::{Function, Param};
use alloy::primitives::{Address, Bytes, TxKind, B256, I256, U256};
use serde_json::Value;

use paladin_keys::algorithms;
use paladin_plugin::pb;

use crate::error::{EngineError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY POINTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Service an `EncodeData` callback.
pub fn encode_data(chain_id: u64, request: &pb::EncodeDataRequest) -> Result<pb::EncodeDataResponse> {
    let data = match request.encoding_type() {
        pb::encode_data_request::EncodingType::FunctionCallData => {
            encode_function_call(&request.definition, &request.body)?
        }
        pb::encode_data_request::EncodingType::Tuple => {
            encode_tuple(&request.definition, &request.body)?
        }
        pb::encode_data_request::EncodingType::EthTransaction => {
            encode_eth_transaction(chain_id, &request.definition, &request.body)?
        }
        pb::encode_data_request::EncodingType::TypedDataV4 => encode_typed_data(&request.body)?,
    };
    Ok(pb::EncodeDataResponse { data })
}

/// Service a `RecoverSigner` callback.
pub fn recover_signer(request: &pb::RecoverSignerRequest) -> Result<pb::RecoverSignerResponse> {
    if request.algorithm != algorithms::ECDSA_SECP256K1
        || request.payload_type != algorithms::PAYLOAD_OPAQUE_RSV
    {
        return Err(EngineError::RecoverAlgorithmUnsupported {
            algorithm: request.algorithm.clone(),
            payload_type: request.payload_type.clone(),
        });
    }
    let address = paladin_keys::recover_opaque_rsv(&request.payload, &request.signature)?;
    Ok(pb::RecoverSignerResponse {
        verifier: format!("{address:#x}"),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// ABI ENCODING
// ═══════════════════════════════════════════════════════════════════════════════

fn encode_function_call(definition: &str, body: &str) -> Result<Vec<u8>> {
    let function: Function = serde_json::from_str(definition)
        .map_err(|e| EngineError::AbiInvalid(format!("function entry: {e}")))?;
    let body: Value = serde_json::from_str(body)?;
    let values = params_to_values(&function.inputs, &body)?;
    function
        .abi_encode_input(&values)
        .map_err(|e| EngineError::EncodingUnsupported(format!("call data: {e}")))
}

fn encode_tuple(definition: &str, body: &str) -> Result<Vec<u8>> {
    let param: Param = serde_json::from_str(definition)
        .map_err(|e| EngineError::AbiInvalid(format!("tuple parameter: {e}")))?;
    let body: Value = serde_json::from_str(body)?;
    let value = param_value(&param, &body)?;
    Ok(value.abi_encode_params())
}

/// Convert a JSON body into values for a list of parameters.
///
/// Objects are matched by parameter name; arrays positionally.
fn params_to_values(params: &[Param], body: &Value) -> Result<Vec<DynSolValue>> {
    params
        .iter()
        .enumerate()
        .map(|(index, param)| {
            let field = match body {
                Value::Object(map) => map.get(&param.name),
                Value::Array(items) => items.get(index),
                _ => None,
            }
            .ok_or_else(|| {
                EngineError::EncodingUnsupported(format!("missing value for {:?}", param.name))
            })?;
            param_value(param, field)
        })
        .collect()
}

/// Convert one JSON value to the parameter's ABI value, recursively.
fn param_value(param: &Param, value: &Value) -> Result<DynSolValue> {
    // Arrays: peel one suffix and convert elements
    if let Some(base) = array_base(&param.ty) {
        let items = value.as_array().ok_or_else(|| {
            EngineError::EncodingUnsupported(format!("{:?} expects an array", param.name))
        })?;
        let element = Param {
            ty: base.to_string(),
            ..param.clone()
        };
        let converted = items
            .iter()
            .map(|item| param_value(&element, item))
            .collect::<Result<Vec<_>>>()?;
        return Ok(DynSolValue::Array(converted));
    }

    if param.ty == "tuple" {
        let fields = params_to_values(&param.components, value)?;
        return Ok(DynSolValue::Tuple(fields));
    }

    let ty = DynSolType::parse(&param.ty)
        .map_err(|e| EngineError::AbiInvalid(format!("type {:?}: {e}", param.ty)))?;
    scalar_value(&ty, value)
}

fn array_base(ty: &str) -> Option<&str> {
    ty.strip_suffix("[]").or_else(|| {
        let open = ty.rfind('[')?;
        ty.ends_with(']').then(|| &ty[..open])
    })
}

fn scalar_value(ty: &DynSolType, value: &Value) -> Result<DynSolValue> {
    let unsupported =
        |detail: &str| EngineError::EncodingUnsupported(format!("{ty} from {value}: {detail}"));
    match ty {
        DynSolType::Bool => value
            .as_bool()
            .map(DynSolValue::Bool)
            .ok_or_else(|| unsupported("expected bool")),
        DynSolType::Address => value
            .as_str()
            .and_then(|s| s.parse::<Address>().ok())
            .map(DynSolValue::Address)
            .ok_or_else(|| unsupported("expected address")),
        DynSolType::Uint(bits) => {
            Ok(DynSolValue::Uint(json_u256(value).ok_or_else(|| unsupported("expected uint"))?, *bits))
        }
        DynSolType::Int(bits) => {
            let parsed = match value {
                Value::Number(n) => n.as_i64().map(I256::try_from).and_then(std::result::Result::ok),
                Value::String(s) => s.parse::<I256>().ok(),
                _ => None,
            };
            Ok(DynSolValue::Int(parsed.ok_or_else(|| unsupported("expected int"))?, *bits))
        }
        DynSolType::FixedBytes(size) => {
            let bytes = json_bytes(value).ok_or_else(|| unsupported("expected hex bytes"))?;
            if bytes.len() != *size {
                return Err(unsupported("wrong byte length"));
            }
            Ok(DynSolValue::FixedBytes(B256::right_padding_from(&bytes), *size))
        }
        DynSolType::Bytes => json_bytes(value)
            .map(DynSolValue::Bytes)
            .ok_or_else(|| unsupported("expected hex bytes")),
        DynSolType::String => value
            .as_str()
            .map(|s| DynSolValue::String(s.to_string()))
            .ok_or_else(|| unsupported("expected string")),
        other => Err(EngineError::EncodingUnsupported(format!(
            "unsupported parameter type {other}"
        ))),
    }
}

fn json_u256(value: &Value) -> Option<U256> {
    match value {
        Value::Number(n) => n.as_u64().map(U256::from),
        Value::String(s) => {
            if let Some(hex) = s.strip_prefix("0x") {
                U256::from_str_radix(hex, 16).ok()
            } else {
                U256::from_str_radix(s, 10).ok()
            }
        }
        _ => None,
    }
}

fn json_bytes(value: &Value) -> Option<Vec<u8>> {
    value
        .as_str()
        .and_then(|s| hex::decode(s.trim_start_matches("0x")).ok())
}

// ═══════════════════════════════════════════════════════════════════════════════
// ETH TRANSACTION PAYLOADS
// ═══════════════════════════════════════════════════════════════════════════════

/// Build the signing payload for a base-ledger transaction.
///
/// Only EIP-1559 (default) and EIP-155 are supported - both bind the chain
/// ID into the signed payload.
fn encode_eth_transaction(chain_id: u64, definition: &str, body: &str) -> Result<Vec<u8>> {
    let tx: Value = serde_json::from_str(body)?;
    let to = tx
        .get("to")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Address>().ok())
        .map_or(TxKind::Create, TxKind::Call);
    let nonce = tx.get("nonce").and_then(|v| json_u256(v)).unwrap_or_default();
    let gas_limit = tx
        .get("gasLimit")
        .or_else(|| tx.get("gas"))
        .and_then(|v| json_u256(v))
        .unwrap_or_default();
    let value = tx.get("value").and_then(|v| json_u256(v)).unwrap_or_default();
    let input: Bytes = tx
        .get("data")
        .or_else(|| tx.get("input"))
        .and_then(json_bytes)
        .unwrap_or_default()
        .into();

    let mut payload = Vec::new();
    match definition {
        "" | "eip1559" | "eip-1559" => {
            let tx1559 = TxEip1559 {
                chain_id,
                nonce: nonce.to::<u64>(),
                gas_limit: gas_limit.to::<u64>(),
                max_fee_per_gas: tx
                    .get("maxFeePerGas")
                    .and_then(|v| json_u256(v))
                    .unwrap_or_default()
                    .to::<u128>(),
                max_priority_fee_per_gas: tx
                    .get("maxPriorityFeePerGas")
                    .and_then(|v| json_u256(v))
                    .unwrap_or_default()
                    .to::<u128>(),
                to,
                value,
                access_list: Default::default(),
                input,
            };
            tx1559.encode_for_signing(&mut payload);
        }
        "eip155" | "eip-155" => {
            let legacy = TxLegacy {
                chain_id: Some(chain_id),
                nonce: nonce.to::<u64>(),
                gas_price: tx
                    .get("gasPrice")
                    .and_then(|v| json_u256(v))
                    .unwrap_or_default()
                    .to::<u128>(),
                gas_limit: gas_limit.to::<u64>(),
                to,
                value,
                input,
            };
            legacy.encode_for_signing(&mut payload);
        }
        other => {
            return Err(EngineError::EncodingUnsupported(format!(
                "eth transaction flavor {other:?}"
            )));
        }
    }
    Ok(payload)
}

// ═══════════════════════════════════════════════════════════════════════════════
// EIP-712
// ═══════════════════════════════════════════════════════════════════════════════

fn encode_typed_data(body: &str) -> Result<Vec<u8>> {
    let typed: TypedData = serde_json::from_str(body)
        .map_err(|e| EngineError::EncodingUnsupported(format!("typed data: {e}")))?;
    let hash = typed
        .eip712_signing_hash()
        .map_err(|e| EngineError::EncodingUnsupported(format!("typed data hash: {e}")))?;
    Ok(hash.to_vec())
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolValue;

    fn encode(kind: pb::encode_data_request::EncodingType, definition: &str, body: &str) -> Vec<u8> {
        encode_data(
            1337,
            &pb::EncodeDataRequest {
                encoding_type: kind as i32,
                definition: definition.into(),
                body: body.into(),
            },
        )
        .unwrap()
        .data
    }

    #[test]
    fn function_call_matches_static_encoding() {
        let definition = r#"{
            "type": "function",
            "name": "transfer",
            "inputs": [
                {"name": "to", "type": "address"},
                {"name": "amount", "type": "uint256"}
            ]
        }"#;
        let body = r#"{"to": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "amount": "500"}"#;

        let encoded = encode(
            pb::encode_data_request::EncodingType::FunctionCallData,
            definition,
            body,
        );

        let function: Function = serde_json::from_str(definition).unwrap();
        let expected_params =
            (Address::repeat_byte(0xAA), U256::from(500)).abi_encode_params();
        assert_eq!(&encoded[..4], function.selector().as_slice());
        assert_eq!(&encoded[4..], &expected_params[..]);
    }

    #[test]
    fn tuple_encoding_handles_nested_arrays() {
        let definition = r#"{
            "name": "batch",
            "type": "tuple",
            "components": [
                {"name": "ids", "type": "bytes32[]"},
                {"name": "flag", "type": "bool"}
            ]
        }"#;
        let body = format!(
            r#"{{"ids": ["{:#x}", "{:#x}"], "flag": true}}"#,
            B256::repeat_byte(1),
            B256::repeat_byte(2)
        );
        let encoded = encode(pb::encode_data_request::EncodingType::Tuple, definition, &body);
        let expected =
            (vec![B256::repeat_byte(1), B256::repeat_byte(2)], true).abi_encode_params();
        assert_eq!(encoded, expected);
    }

    #[test]
    fn eth_transaction_flavors_differ_and_are_deterministic() {
        let body = r#"{"to": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                       "nonce": 7, "gas": 21000, "value": "1000",
                       "maxFeePerGas": "2000000000", "gasPrice": "1000000000"}"#;
        let kind = pb::encode_data_request::EncodingType::EthTransaction;

        let eip1559 = encode(kind, "", body);
        let eip1559_again = encode(kind, "eip1559", body);
        let eip155 = encode(kind, "eip155", body);

        assert_eq!(eip1559, eip1559_again);
        assert_ne!(eip1559, eip155);
        // EIP-2718 typed envelope for 1559
        assert_eq!(eip1559[0], 0x02);
    }

    #[test]
    fn unknown_eth_flavor_rejected() {
        let request = pb::EncodeDataRequest {
            encoding_type: pb::encode_data_request::EncodingType::EthTransaction as i32,
            definition: "eip2930".into(),
            body: "{}".into(),
        };
        assert!(matches!(
            encode_data(1, &request),
            Err(EngineError::EncodingUnsupported(_))
        ));
    }

    #[test]
    fn sign_recover_round_trip() {
        use alloy::signers::{local::PrivateKeySigner, SignerSync};

        let signer = PrivateKeySigner::from_bytes(&B256::repeat_byte(0x42)).unwrap();
        let payload = b"the payload".to_vec();
        let digest = alloy::primitives::keccak256(&payload);
        let signature = signer.sign_hash_sync(&digest).unwrap();

        let response = recover_signer(&pb::RecoverSignerRequest {
            algorithm: algorithms::ECDSA_SECP256K1.into(),
            payload_type: algorithms::PAYLOAD_OPAQUE_RSV.into(),
            payload,
            signature: signature.as_bytes().to_vec(),
        })
        .unwrap();
        assert_eq!(response.verifier, format!("{:#x}", signer.address()));
    }

    #[test]
    fn unsupported_recovery_algorithm_rejected() {
        let err = recover_signer(&pb::RecoverSignerRequest {
            algorithm: "bls:12-381".into(),
            payload_type: algorithms::PAYLOAD_OPAQUE_RSV.into(),
            payload: vec![],
            signature: vec![],
        })
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::RecoverAlgorithmUnsupported { .. }
        ));
    }
}
