//! The engine ↔ domain contract.
//!
//! [`DomainPlugin`] is everything the engine asks of a domain implementation;
//! [`DomainCallbacks`] is everything a domain may ask back of the engine
//! while servicing a request. Both the gRPC stream bridge and in-process
//! domains implement `DomainPlugin`, so the engine never cares where a
//! domain actually runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pb;

// ═══════════════════════════════════════════════════════════════════════════════
// LEDGER EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// One decoded on-ledger event, as serialized into
/// [`pb::HandleEventBatchRequest::json_events`].
///
/// The block indexer decodes raw logs against the domain's events ABI before
/// delivery, so `data` is already the structured event body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Emitting contract address, hex.
    pub address: String,
    /// Block the event landed in.
    pub block_number: u64,
    /// Log index within the block.
    pub log_index: u64,
    /// Transaction hash, hex.
    pub transaction_hash: String,
    /// Decoded event name, e.g. `NotoTransfer`.
    pub event_name: String,
    /// Decoded event body.
    pub data: serde_json::Value,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE → DOMAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Operations the engine invokes on a domain.
#[async_trait]
pub trait DomainPlugin: Send + Sync + 'static {
    /// Exchange configuration: the engine describes the deployment, the
    /// domain answers with schemas, its events ABI and submit behavior.
    async fn configure_domain(
        &self,
        request: pb::ConfigureDomainRequest,
    ) -> Result<pb::ConfigureDomainResponse>;

    /// Complete initialization with the recorded schema IDs.
    async fn init_domain(&self, request: pb::InitDomainRequest) -> Result<pb::InitDomainResponse>;

    /// Start a deployment: the domain names the verifiers it needs resolved.
    async fn init_deploy(&self, request: pb::InitDeployRequest) -> Result<pb::InitDeployResponse>;

    /// Produce the base-ledger artifact for a deployment.
    async fn prepare_deploy(
        &self,
        request: pb::PrepareDeployRequest,
    ) -> Result<pb::PrepareDeployResponse>;

    /// Start a transaction: the domain names the verifiers it needs resolved.
    async fn init_transaction(
        &self,
        request: pb::InitTransactionRequest,
    ) -> Result<pb::InitTransactionResponse>;

    /// Assemble input/output states and the attestation plan.
    async fn assemble_transaction(
        &self,
        request: pb::AssembleTransactionRequest,
    ) -> Result<pb::AssembleTransactionResponse>;

    /// Re-validate an assembled transaction as an endorser.
    async fn endorse_transaction(
        &self,
        request: pb::EndorseTransactionRequest,
    ) -> Result<pb::EndorseTransactionResponse>;

    /// Produce the base-ledger artifact for an assembled transaction.
    async fn prepare_transaction(
        &self,
        request: pb::PrepareTransactionRequest,
    ) -> Result<pb::PrepareTransactionResponse>;

    /// Interpret one ordered batch of on-ledger events for one contract.
    async fn handle_event_batch(
        &self,
        request: pb::HandleEventBatchRequest,
    ) -> Result<pb::HandleEventBatchResponse>;

    /// Derive a verifier from key material (domain-side algorithms).
    async fn get_verifier(
        &self,
        request: pb::GetVerifierRequest,
    ) -> Result<pb::GetVerifierResponse>;

    /// Sign with key material (domain-side algorithms).
    async fn sign(&self, request: pb::SignRequest) -> Result<pb::SignResponse>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOMAIN → ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Callbacks a domain invokes on the engine while servicing a request.
///
/// The engine holds no locks across plugin RPCs, so these can re-enter
/// freely; each call opens its own domain context.
#[async_trait]
pub trait DomainCallbacks: Send + Sync + 'static {
    /// Query available states of one contract, by ID or nullifier.
    async fn find_available_states(
        &self,
        request: pb::FindAvailableStatesRequest,
    ) -> Result<pb::FindAvailableStatesResponse>;

    /// Pure data encoding (function calls, tuples, eth transactions,
    /// EIP-712 typed data).
    async fn encode_data(&self, request: pb::EncodeDataRequest) -> Result<pb::EncodeDataResponse>;

    /// Recover the signer of a payload.
    async fn recover_signer(
        &self,
        request: pb::RecoverSignerRequest,
    ) -> Result<pb::RecoverSignerResponse>;
}
