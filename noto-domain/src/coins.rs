//! Noto coins: parsing, selection and the unmasked transfer payload.
//!
//! A coin is one UTXO-style state `{salt, owner, amount}`. Coin selection
//! queries the engine's state store (through the domain callbacks) for the
//! sender's available coins in deterministic order and accumulates until the
//! requested amount is covered.

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolValue;
use rand::RngCore;
use serde_json::{json, Value};

use paladin_plugin::{pb, DomainCallbacks};

use crate::error::{NotoError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// COIN
// ═══════════════════════════════════════════════════════════════════════════════

/// One fungible coin state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotoCoin {
    /// Uniqueness nonce.
    pub salt: B256,
    /// Owning address.
    pub owner: Address,
    /// Coin value.
    pub amount: U256,
}

impl NotoCoin {
    /// Mint a coin with a random salt.
    #[must_use]
    pub fn new_random(owner: Address, amount: U256) -> Self {
        let mut salt = [0u8; 32];
        rand::rng().fill_bytes(&mut salt);
        Self {
            salt: B256::from(salt),
            owner,
            amount,
        }
    }

    /// The state data payload for this coin.
    #[must_use]
    pub fn to_data_json(&self) -> Value {
        json!({
            "salt": format!("{:#x}", self.salt),
            "owner": format!("{:#x}", self.owner),
            "amount": self.amount.to_string(),
        })
    }

    /// Parse a coin from state data.
    pub fn from_data_json(data: &Value) -> Result<Self> {
        let salt = parse_b256(data.get("salt"))?;
        let owner = data
            .get("owner")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Address>().ok())
            .ok_or_else(|| NotoError::DataInvalid("coin owner missing or malformed".into()))?;
        let amount = parse_u256(
            data.get("amount")
                .ok_or_else(|| NotoError::DataInvalid("coin amount missing".into()))?,
        )?;
        Ok(Self {
            salt,
            owner,
            amount,
        })
    }
}

/// Parse a `U256` from a JSON number, decimal string or `0x` hex string.
pub fn parse_u256(value: &Value) -> Result<U256> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| NotoError::DataInvalid(format!("not an unsigned amount: {n}"))),
        Value::String(s) => {
            let parsed = if let Some(hex) = s.strip_prefix("0x") {
                U256::from_str_radix(hex, 16)
            } else {
                U256::from_str_radix(s, 10)
            };
            parsed.map_err(|e| NotoError::DataInvalid(format!("malformed amount {s:?}: {e}")))
        }
        other => Err(NotoError::DataInvalid(format!(
            "amount must be number or string, got {other}"
        ))),
    }
}

fn parse_b256(value: Option<&Value>) -> Result<B256> {
    value
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<B256>().ok())
        .ok_or_else(|| NotoError::DataInvalid("missing or malformed 32-byte value".into()))
}

/// Parse a state ID string (`0x` + 64 hex chars).
pub fn parse_state_id(id: &str) -> Result<B256> {
    id.parse::<B256>()
        .map_err(|e| NotoError::DataInvalid(format!("malformed state ID {id:?}: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// SELECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of coin selection: the coins, their state refs, and the total.
#[derive(Debug, Clone)]
pub struct CoinSelection {
    /// Selected coins in selection order.
    pub coins: Vec<NotoCoin>,
    /// State references for the assembled transaction.
    pub states: Vec<pb::StateRef>,
    /// Sum of the selected coin values.
    pub total: U256,
}

/// Select available coins of `owner` until `amount` is covered.
///
/// An owner whose available total cannot cover the amount yields
/// [`NotoError::InsufficientFunds`]; the assemble paths turn that variant
/// into a REVERT assembly result rather than a request error.
pub async fn select_coins(
    callbacks: &dyn DomainCallbacks,
    contract_address: &str,
    schema_id: &str,
    owner: Address,
    amount: U256,
) -> Result<CoinSelection> {
    let query = json!({
        "eq": [{"field": "owner", "value": format!("{owner:#x}")}],
    });
    let response = callbacks
        .find_available_states(pb::FindAvailableStatesRequest {
            contract_address: contract_address.to_string(),
            schema_id: schema_id.to_string(),
            query_json: query.to_string(),
            use_nullifiers: None,
        })
        .await?;

    let mut selection = CoinSelection {
        coins: Vec::new(),
        states: Vec::new(),
        total: U256::ZERO,
    };
    for state in response.states {
        let data: Value = serde_json::from_str(&state.data_json)?;
        let coin = NotoCoin::from_data_json(&data)?;
        selection.total += coin.amount;
        selection.coins.push(coin);
        selection.states.push(pb::StateRef {
            id: state.id,
            schema_id: state.schema_id,
        });
        if selection.total >= amount {
            return Ok(selection);
        }
    }
    Err(NotoError::InsufficientFunds {
        needed: amount.to_string(),
        available: selection.total.to_string(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFER PAYLOAD
// ═══════════════════════════════════════════════════════════════════════════════

/// The unmasked transfer encoding the sender signs and the notary verifies.
///
/// ABI encoding of `(contract, inputs[], outputs[])`; deterministic for a
/// given assembled transaction.
#[must_use]
pub fn transfer_payload(contract: Address, inputs: &[B256], outputs: &[B256]) -> Vec<u8> {
    (contract, inputs.to_vec(), outputs.to_vec()).abi_encode()
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_data_round_trip() {
        let coin = NotoCoin::new_random(Address::repeat_byte(0xAA), U256::from(500));
        let parsed = NotoCoin::from_data_json(&coin.to_data_json()).unwrap();
        assert_eq!(parsed, coin);
    }

    #[test]
    fn amounts_parse_across_encodings() {
        assert_eq!(parse_u256(&json!("500")).unwrap(), U256::from(500));
        assert_eq!(parse_u256(&json!("0x1f4")).unwrap(), U256::from(500));
        assert_eq!(parse_u256(&json!(500)).unwrap(), U256::from(500));
        assert!(parse_u256(&json!("bogus")).is_err());
        assert!(parse_u256(&json!(-1)).is_err());
    }

    #[test]
    fn transfer_payload_is_deterministic() {
        let contract = Address::repeat_byte(0xC0);
        let inputs = vec![B256::repeat_byte(1), B256::repeat_byte(2)];
        let outputs = vec![B256::repeat_byte(3)];
        assert_eq!(
            transfer_payload(contract, &inputs, &outputs),
            transfer_payload(contract, &inputs, &outputs)
        );
        assert_ne!(
            transfer_payload(contract, &inputs, &outputs),
            transfer_payload(contract, &outputs, &inputs)
        );
    }
}
