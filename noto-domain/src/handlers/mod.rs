//! Function handlers.
//!
//! Each token function implements the same capability set - validate, init,
//! assemble, endorse, prepare - and is dispatched by the function name on
//! the transaction specification.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde_json::Value;

use paladin_keys::algorithms;
use paladin_plugin::pb;

use crate::coins::{parse_state_id, parse_u256, NotoCoin};
use crate::config::NotoConfig;
use crate::error::{NotoError, Result};
use crate::Noto;

mod burn;
mod mint;
mod transfer;

pub(crate) use burn::BurnHandler;
pub(crate) use mint::MintHandler;
pub(crate) use transfer::TransferHandler;

// ═══════════════════════════════════════════════════════════════════════════════
// PARAMETERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Parameters of `mint(to, amount)`.
#[derive(Debug, Clone)]
pub struct MintParams {
    /// Identity lookup of the recipient.
    pub to: String,
    /// Amount to mint.
    pub amount: U256,
}

/// Parameters of `transfer(to, amount)`.
#[derive(Debug, Clone)]
pub struct TransferParams {
    /// Identity lookup of the recipient.
    pub to: String,
    /// Amount to transfer.
    pub amount: U256,
}

/// Parameters of `burn(amount)`.
#[derive(Debug, Clone)]
pub struct BurnParams {
    /// Amount to burn.
    pub amount: U256,
}

/// Parsed, validated parameters of any supported function.
#[derive(Debug, Clone)]
pub enum FunctionParams {
    /// `mint(to, amount)`
    Mint(MintParams),
    /// `transfer(to, amount)`
    Transfer(TransferParams),
    /// `burn(amount)`
    Burn(BurnParams),
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSED TRANSACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A transaction specification after parsing and parameter validation.
#[derive(Debug, Clone)]
pub struct ParsedTransaction {
    /// Transaction ID (bytes32 hex, UUID in the first 16 bytes).
    pub id: String,
    /// Sender identity lookup.
    pub from: String,
    /// The private contract address, hex.
    pub contract_address: String,
    /// The contract's Noto configuration.
    pub config: NotoConfig,
    /// Validated function parameters.
    pub params: FunctionParams,
}

impl ParsedTransaction {
    /// Parse a wire transaction specification.
    pub fn parse(spec: &pb::TransactionSpecification) -> Result<Self> {
        let config = NotoConfig::from_config_hex(&spec.contract_config)?;
        let params_json: Value = serde_json::from_str(if spec.function_params_json.is_empty() {
            "{}"
        } else {
            &spec.function_params_json
        })?;
        let params = match spec.function_name.as_str() {
            "mint" => FunctionParams::Mint(MintParams {
                to: required_lookup(&params_json, "to")?,
                amount: positive_amount(&params_json)?,
            }),
            "transfer" => FunctionParams::Transfer(TransferParams {
                to: required_lookup(&params_json, "to")?,
                amount: positive_amount(&params_json)?,
            }),
            "burn" => FunctionParams::Burn(BurnParams {
                amount: positive_amount(&params_json)?,
            }),
            other => return Err(NotoError::FunctionUnknown(other.to_string())),
        };
        if spec.from.is_empty() {
            return Err(NotoError::ParamInvalid("sender must be set".into()));
        }
        Ok(Self {
            id: spec.transaction_id.clone(),
            from: spec.from.clone(),
            contract_address: spec.contract_address.clone(),
            config,
            params,
        })
    }

    /// The handler for this transaction's function.
    pub(crate) fn handler(&self) -> &'static dyn FunctionHandler {
        match self.params {
            FunctionParams::Mint(_) => &MintHandler,
            FunctionParams::Transfer(_) => &TransferHandler,
            FunctionParams::Burn(_) => &BurnHandler,
        }
    }
}

fn required_lookup(params: &Value, field: &str) -> Result<String> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| NotoError::ParamInvalid(format!("{field} must be set")))
}

fn positive_amount(params: &Value) -> Result<U256> {
    let amount = parse_u256(
        params
            .get("amount")
            .ok_or_else(|| NotoError::ParamInvalid("amount must be set".into()))?,
    )?;
    if amount.is_zero() {
        return Err(NotoError::ParamInvalid(
            "amount must be greater than zero".into(),
        ));
    }
    Ok(amount)
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLER CONTRACT
// ═══════════════════════════════════════════════════════════════════════════════

/// The capability set every token function implements.
#[async_trait]
pub(crate) trait FunctionHandler: Send + Sync {
    /// Name the verifiers that must be resolved before assembly.
    fn init(
        &self,
        tx: &ParsedTransaction,
        request: &pb::InitTransactionRequest,
    ) -> Result<pb::InitTransactionResponse>;

    /// Select inputs, produce outputs and the attestation plan.
    async fn assemble(
        &self,
        noto: &Noto,
        tx: &ParsedTransaction,
        request: &pb::AssembleTransactionRequest,
    ) -> Result<pb::AssembleTransactionResponse>;

    /// Re-validate the assembled transaction as the notary.
    async fn endorse(
        &self,
        noto: &Noto,
        tx: &ParsedTransaction,
        request: &pb::EndorseTransactionRequest,
    ) -> Result<pb::EndorseTransactionResponse>;

    /// Emit the base-ledger invoke.
    async fn prepare(
        &self,
        noto: &Noto,
        tx: &ParsedTransaction,
        request: &pb::PrepareTransactionRequest,
    ) -> Result<pb::PrepareTransactionResponse>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Find the resolved Ethereum address verifier for an identity lookup.
pub(crate) fn find_eth_verifier(
    lookup: &str,
    resolved: &[pb::ResolvedVerifier],
) -> Result<Address> {
    resolved
        .iter()
        .find(|v| {
            v.lookup == lookup
                && v.algorithm == algorithms::ECDSA_SECP256K1
                && v.verifier_type == algorithms::VERIFIER_ETH_ADDRESS
        })
        .and_then(|v| v.verifier.parse::<Address>().ok())
        .ok_or_else(|| NotoError::VerifierMissing(lookup.to_string()))
}

/// Find a named attestation result.
pub(crate) fn find_attestation<'a>(
    name: &str,
    results: &'a [pb::AttestationResult],
) -> Result<&'a pb::AttestationResult> {
    results
        .iter()
        .find(|r| r.name == name)
        .ok_or_else(|| NotoError::AttestationMissing(name.to_string()))
}

/// Parse a list of endorsable states into coins plus their IDs.
pub(crate) fn parse_coin_list(
    label: &str,
    states: &[pb::EndorsableState],
) -> Result<(Vec<NotoCoin>, Vec<alloy::primitives::B256>)> {
    let mut coins = Vec::with_capacity(states.len());
    let mut ids = Vec::with_capacity(states.len());
    for state in states {
        let data: Value = serde_json::from_str(&state.state_data_json)
            .map_err(|e| NotoError::DataInvalid(format!("{label} state {}: {e}", state.id)))?;
        coins.push(NotoCoin::from_data_json(&data)?);
        ids.push(parse_state_id(&state.id)?);
    }
    Ok((coins, ids))
}

/// Sum of a list of coin values.
pub(crate) fn total_amount(coins: &[NotoCoin]) -> U256 {
    coins.iter().fold(U256::ZERO, |acc, c| acc + c.amount)
}

/// The standard two-party attestation plan: sender signature + notary
/// endorsement over the unmasked transfer payload.
pub(crate) fn attestation_plan(
    tx: &ParsedTransaction,
    payload: Vec<u8>,
) -> Vec<pb::AttestationRequest> {
    vec![
        pb::AttestationRequest {
            name: "sender".into(),
            attestation_type: pb::AttestationType::Sign as i32,
            algorithm: algorithms::ECDSA_SECP256K1.into(),
            verifier_type: algorithms::VERIFIER_ETH_ADDRESS.into(),
            payload_type: algorithms::PAYLOAD_OPAQUE_RSV.into(),
            payload,
            parties: vec![tx.from.clone()],
        },
        pb::AttestationRequest {
            name: "notary".into(),
            attestation_type: pb::AttestationType::Endorse as i32,
            algorithm: algorithms::ECDSA_SECP256K1.into(),
            verifier_type: algorithms::VERIFIER_ETH_ADDRESS.into(),
            payload_type: String::new(),
            payload: Vec::new(),
            parties: vec![tx.config.notary.clone()],
        },
    ]
}

/// Named verifier requirements for a set of identity lookups.
pub(crate) fn eth_address_verifiers(lookups: &[&str]) -> Vec<pb::ResolveVerifierRequest> {
    lookups
        .iter()
        .map(|lookup| pb::ResolveVerifierRequest {
            lookup: (*lookup).to_string(),
            algorithm: algorithms::ECDSA_SECP256K1.into(),
            verifier_type: algorithms::VERIFIER_ETH_ADDRESS.into(),
        })
        .collect()
}

/// An assembly REVERT result with the given reason.
pub(crate) fn revert_assembly(reason: String) -> pb::AssembleTransactionResponse {
    pb::AssembleTransactionResponse {
        assembly_result: pb::assemble_transaction_response::AssemblyResult::Revert as i32,
        assembled_transaction: None,
        attestation_plan: Vec::new(),
        revert_reason: Some(reason),
    }
}

/// Build the PUBLIC `transfer(...)` invoke common to every token function.
///
/// Requires the notary's endorsement and the sender's signature to be among
/// the attestation results; the `data` field carries the transaction ID so
/// the event path can complete the in-flight waiter.
pub(crate) fn transfer_invoke(
    tx: &ParsedTransaction,
    request: &pb::PrepareTransactionRequest,
) -> Result<pb::PrepareTransactionResponse> {
    let endorsement = find_attestation("notary", &request.attestation_result)?;
    let endorsed_by_notary = endorsement
        .verifier
        .as_ref()
        .is_some_and(|v| v.lookup == tx.config.notary);
    if !endorsed_by_notary {
        return Err(NotoError::AttestationMissing("notary".into()));
    }
    let sender = find_attestation("sender", &request.attestation_result)?;

    let inputs: Vec<String> = request.input_states.iter().map(|s| s.id.clone()).collect();
    let outputs: Vec<String> = request.output_states.iter().map(|s| s.id.clone()).collect();
    let params = serde_json::json!({
        "txId": tx.id,
        "inputs": inputs,
        "outputs": outputs,
        "signature": format!("0x{}", hex::encode(&sender.payload)),
        "data": tx.id,
    });

    Ok(pb::PrepareTransactionResponse {
        transaction: Some(pb::BaseLedgerTransaction {
            function_abi_json: crate::abi::TRANSFER_FN_ABI_JSON.to_string(),
            params_json: params.to_string(),
        }),
        deploy: None,
        signer: None,
    })
}

/// Verify the collected sender signature over the transfer payload.
pub(crate) async fn validate_sender_signature(
    noto: &Noto,
    tx: &ParsedTransaction,
    signatures: &[pb::AttestationResult],
    resolved: &[pb::ResolvedVerifier],
    payload: &[u8],
) -> Result<()> {
    let sender = find_attestation("sender", signatures)?;
    let expected = find_eth_verifier(&tx.from, resolved)?;
    let recovered = noto
        .callbacks()
        .recover_signer(pb::RecoverSignerRequest {
            algorithm: algorithms::ECDSA_SECP256K1.into(),
            payload_type: algorithms::PAYLOAD_OPAQUE_RSV.into(),
            payload: payload.to_vec(),
            signature: sender.payload.clone(),
        })
        .await?;
    let recovered_address = recovered
        .verifier
        .parse::<Address>()
        .map_err(|e| NotoError::SignatureInvalid(e.to_string()))?;
    if recovered_address != expected {
        return Err(NotoError::SignatureInvalid(format!(
            "recovered {recovered_address:#x}, expected {expected:#x}"
        )));
    }
    Ok(())
}
