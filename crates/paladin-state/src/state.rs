//! State records, locks and content-addressed IDs.
//!
//! A state is one immutable record conforming to a schema. Its ID is a hash
//! over `(schema_id, canonical_json(data))`, so equal content always produces
//! the same ID; the `salt` field inside the data is the uniqueness nonce.

use alloy::primitives::{keccak256, Address, B256};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// LOCKS
// ═══════════════════════════════════════════════════════════════════════════════

/// A per-transaction lock on a state.
///
/// `creating` and `spending` record which side of the lifecycle the locking
/// transaction is driving; both may be set when a transaction chains its own
/// outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLock {
    /// The transaction holding the lock.
    pub tx_id: Uuid,
    /// The transaction is creating this state.
    pub creating: bool,
    /// The transaction intends to spend this state.
    pub spending: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

/// A stored state with its observable status attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    /// Content-addressed ID.
    pub id: B256,
    /// The schema this record conforms to.
    pub schema_id: B256,
    /// Owning domain.
    pub domain: String,
    /// The private contract the state belongs to.
    pub contract: Address,
    /// Structured payload (shape given by the schema).
    pub data: Value,
    /// Creation timestamp, assigned on first write.
    pub created_at: DateTime<Utc>,
    /// Current lock, if any.
    pub lock: Option<StateLock>,
    /// Whether the state has been confirmed on the shared ledger.
    pub confirmed: bool,
    /// Whether the state has been spent.
    pub spent: bool,
    /// Optional nullifier hiding this state's ID on the shared ledger.
    pub nullifier: Option<B256>,
}

impl StateRecord {
    /// Whether this state is available to `tx`:
    /// `confirmed ∧ ¬spent ∧ (¬locked ∨ locked-by = tx)`.
    #[must_use]
    pub fn available_to(&self, tx: Option<Uuid>) -> bool {
        self.confirmed
            && !self.spent
            && match self.lock {
                None => true,
                Some(lock) => tx == Some(lock.tx_id),
            }
    }

    /// The state ID as a `0x`-prefixed hex string.
    #[must_use]
    pub fn id_string(&self) -> String {
        format!("0x{}", hex::encode(self.id))
    }
}

/// A new (or re-asserted) state handed to a domain context.
#[derive(Debug, Clone)]
pub struct StateUpsert {
    /// Explicit ID; derived from the content when absent.
    pub id: Option<B256>,
    /// The schema the data conforms to.
    pub schema_id: B256,
    /// Structured payload.
    pub data: Value,
    /// Whether the writing transaction should hold a creating lock.
    pub creating: bool,
}

/// Attaches a nullifier to a state.
#[derive(Debug, Clone, Copy)]
pub struct NullifierUpsert {
    /// The state the nullifier belongs to.
    pub state_id: B256,
    /// The nullifier value.
    pub nullifier: B256,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ID DERIVATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Derive the content-addressed ID of a state.
///
/// `keccak256(schema_id ‖ canonical_json(data))`. Canonical JSON serializes
/// object keys in sorted order at every level, so JSON key order in the
/// incoming payload never changes the ID.
#[must_use]
pub fn state_id(schema_id: B256, data: &Value) -> B256 {
    let mut preimage = Vec::with_capacity(64);
    preimage.extend_from_slice(schema_id.as_slice());
    preimage.extend_from_slice(canonical_json(data).as_bytes());
    keccak256(&preimage)
}

/// Render a JSON value with sorted object keys, recursively.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner = keys
                .iter()
                .map(|k| format!("{}:{}", Value::String((*k).clone()), canonical_json(&map[*k])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{inner}}}")
        }
        Value::Array(items) => {
            let inner = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{inner}]")
        }
        other => other.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn state_id_is_content_addressed() {
        let schema = B256::repeat_byte(0x11);
        let a = json!({"salt": "0x01", "amount": "500"});
        let b = json!({"amount": "500", "salt": "0x01"});
        assert_eq!(state_id(schema, &a), state_id(schema, &b));

        let c = json!({"amount": "500", "salt": "0x02"});
        assert_ne!(state_id(schema, &a), state_id(schema, &c));
        assert_ne!(state_id(B256::repeat_byte(0x22), &a), state_id(schema, &a));
    }

    #[test]
    fn availability_follows_lock_and_lifecycle() {
        let tx = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut state = StateRecord {
            id: B256::ZERO,
            schema_id: B256::ZERO,
            domain: "noto".into(),
            contract: Address::ZERO,
            data: json!({}),
            created_at: Utc::now(),
            lock: None,
            confirmed: true,
            spent: false,
            nullifier: None,
        };
        assert!(state.available_to(Some(tx)));
        assert!(state.available_to(None));

        state.lock = Some(StateLock {
            tx_id: tx,
            creating: false,
            spending: true,
        });
        assert!(state.available_to(Some(tx)));
        assert!(!state.available_to(Some(other)));
        assert!(!state.available_to(None));

        state.spent = true;
        assert!(!state.available_to(Some(tx)));

        state.spent = false;
        state.confirmed = false;
        assert!(!state.available_to(Some(tx)));
    }
}
