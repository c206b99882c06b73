//! Core transaction types and ID derivation.

use alloy::primitives::{Address, B256};
use uuid::Uuid;

use paladin_plugin::pb;

use crate::error::{EngineError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSACTION IDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Render a transaction UUID as the bytes32 form used on the wire and on
/// the base ledger (UUID in the first 16 bytes, zero padded).
#[must_use]
pub fn tx_id_bytes32(id: Uuid) -> B256 {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(id.as_bytes());
    B256::from(out)
}

/// Recover a transaction UUID from its bytes32 hex form.
pub fn tx_id_from_bytes32(hex_id: &str) -> Result<Uuid> {
    let bytes: B256 = hex_id
        .parse()
        .map_err(|e| EngineError::Internal(format!("malformed transaction ID {hex_id:?}: {e}")))?;
    let mut first16 = [0u8; 16];
    first16.copy_from_slice(&bytes.as_slice()[..16]);
    Ok(Uuid::from_bytes(first16))
}

// ═══════════════════════════════════════════════════════════════════════════════
// PRIVATE TRANSACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A private transaction moving through the stage machine.
#[derive(Debug, Clone)]
pub struct PrivateTransaction {
    /// Transaction UUID.
    pub id: Uuid,
    /// The domain handling the transaction.
    pub domain: String,
    /// Target private contract; `None` for a deployment.
    pub contract: Option<Address>,
    /// Sender identity lookup.
    pub from: String,
    /// Invoked function name (ignored for deployments).
    pub function: String,
    /// Function (or constructor) inputs as JSON.
    pub inputs: serde_json::Value,
    /// Transactions that must advance before this one.
    pub pre_reqs: Vec<Uuid>,

    // ── Populated as stages advance ────────────────────────────────────────
    /// Verifiers the domain asked for at init.
    pub required_verifiers: Vec<pb::ResolveVerifierRequest>,
    /// Resolved verifiers.
    pub verifiers: Vec<pb::ResolvedVerifier>,
    /// The assembled states.
    pub assembled: Option<pb::AssembledTransaction>,
    /// The attestation plan from assembly.
    pub attestation_plan: Vec<pb::AttestationRequest>,
    /// Collected attestation results.
    pub attestations: Vec<pb::AttestationResult>,
    /// The prepared base-ledger transaction.
    pub prepared: Option<PreparedLedgerTransaction>,
}

impl PrivateTransaction {
    /// A fresh invoke transaction.
    #[must_use]
    pub fn invoke(
        domain: &str,
        contract: Address,
        from: &str,
        function: &str,
        inputs: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: domain.to_string(),
            contract: Some(contract),
            from: from.to_string(),
            function: function.to_string(),
            inputs,
            pre_reqs: Vec::new(),
            required_verifiers: Vec::new(),
            verifiers: Vec::new(),
            assembled: None,
            attestation_plan: Vec::new(),
            attestations: Vec::new(),
            prepared: None,
        }
    }

    /// A fresh deployment transaction.
    #[must_use]
    pub fn deploy(domain: &str, from: &str, constructor_inputs: serde_json::Value) -> Self {
        let mut tx = Self::invoke(domain, Address::ZERO, from, "", constructor_inputs);
        tx.contract = None;
        tx
    }

    /// Declare pre-requisite transactions.
    #[must_use]
    pub fn with_pre_reqs(mut self, pre_reqs: Vec<Uuid>) -> Self {
        self.pre_reqs = pre_reqs;
        self
    }

    /// The bytes32 wire form of this transaction's ID.
    #[must_use]
    pub fn id_bytes32(&self) -> B256 {
        tx_id_bytes32(self.id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PREPARED LEDGER TRANSACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// The base-ledger artifact a prepared transaction submits.
#[derive(Debug, Clone)]
pub enum LedgerOperation {
    /// Invoke a function on an existing public contract.
    Invoke {
        /// Target contract.
        to: Address,
        /// ABI entry of the invoked function.
        function_abi_json: String,
        /// Call parameters as JSON.
        params_json: String,
    },
    /// Deploy a new public contract.
    Deploy {
        /// Constructor ABI entry (empty string: default constructor).
        constructor_abi_json: String,
        /// Contract bytecode, hex.
        bytecode: String,
        /// Constructor parameters as JSON.
        params_json: String,
    },
}

/// A prepared, signer-assigned base-ledger transaction.
#[derive(Debug, Clone)]
pub struct PreparedLedgerTransaction {
    /// The signing key identifier.
    pub signer: String,
    /// What to execute on the base ledger.
    pub operation: LedgerOperation,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECEIPTS
// ═══════════════════════════════════════════════════════════════════════════════

/// A finalization receipt for a transaction that will not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// The transaction failed with a terminal message.
    FailedWithMessage {
        /// The transaction.
        tx_id: Uuid,
        /// Terminal failure reason.
        message: String,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_id_round_trips_through_bytes32() {
        let id = Uuid::new_v4();
        let wire = format!("{:#x}", tx_id_bytes32(id));
        assert_eq!(tx_id_from_bytes32(&wire).unwrap(), id);
    }

    #[test]
    fn deploy_has_no_contract() {
        let tx = PrivateTransaction::deploy("noto", "deployer", serde_json::json!({}));
        assert!(tx.contract.is_none());
    }
}
