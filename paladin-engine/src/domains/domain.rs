//! One active domain: init lifecycle, event handling, transaction mediation.
//!
//! A domain is created at boot and initializes in its own task with
//! indefinite retry: configure → persist schemas → register event stream →
//! init. Success latches `initialized` and signals `init_done` exactly once;
//! cancellation is the only terminal failure.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy::primitives::{keccak256, Address, B256};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use paladin_plugin::{pb, DomainPlugin, LedgerEvent};
use paladin_state::state::canonical_json;
use paladin_state::{Schema, SchemaDef, StateQuery, StateUpsert};

use crate::domains::contract::{ContractRuntime, PrivateContract};
use crate::domains::SharedStateStore;
use crate::error::{EngineError, Result};
use crate::ports::{
    BlockIndexer, EventDeliveryBatch, EventStreamDefinition, EventStreamHandler, EventStreamSource,
    PostCommit,
};
use crate::retry::RetryPolicy;
use crate::sequencer::waiter::TransactionWaiters;
use crate::types::{
    tx_id_from_bytes32, LedgerOperation, PreparedLedgerTransaction, PrivateTransaction,
};

/// ABI of the registry event announcing domain deployments.
pub const REGISTRY_ABI_JSON: &str = r#"[
    {
        "type": "event",
        "name": "PaladinRegisterSmartContract",
        "inputs": [
            {"name": "txId", "type": "bytes32"},
            {"name": "instance", "type": "address"},
            {"name": "config", "type": "bytes"}
        ]
    }
]"#;

/// Event name of the registration event.
const REGISTRATION_EVENT: &str = "PaladinRegisterSmartContract";

// ═══════════════════════════════════════════════════════════════════════════════
// OUTCOMES
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of an assembly request.
#[derive(Debug)]
pub enum AssembleOutcome {
    /// States and attestation plan recorded on the transaction.
    Assembled,
    /// The domain reverted assembly; reason is verbatim.
    Revert(String),
    /// The domain asked to be re-queued for a later attempt.
    Park,
}

/// Result of an endorsement request.
#[derive(Debug)]
pub enum EndorseOutcome {
    /// The endorser authorizes base-ledger submission.
    Submit {
        /// Optional endorsement payload to carry in the result.
        payload: Vec<u8>,
    },
    /// The endorser demands a signature over this payload first.
    Sign {
        /// Payload the endorser wants signed.
        payload: Vec<u8>,
    },
    /// The endorser rejects the transaction.
    Revert(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOMAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// One active domain.
pub struct Domain {
    name: String,
    registry_address: Address,
    config_json: serde_json::Value,
    chain_id: u64,
    plugin: Arc<dyn DomainPlugin>,

    store: SharedStateStore,
    block_indexer: Arc<dyn BlockIndexer>,
    contracts: ContractRuntime,
    waiters: TransactionWaiters,
    retry: RetryPolicy,
    cancel: CancellationToken,

    initialized: AtomicBool,
    init_error: parking_lot::Mutex<Option<String>>,
    init_done: watch::Sender<bool>,
    init_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,

    schemas_by_id: parking_lot::Mutex<BTreeMap<String, Schema>>,
    submit_config: parking_lot::Mutex<Option<pb::BaseLedgerSubmitConfig>>,
    stream_name: parking_lot::Mutex<Option<String>>,
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("registry_address", &self.registry_address)
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[allow(clippy::too_many_arguments)]
impl Domain {
    pub(crate) fn new(
        name: String,
        registry_address: Address,
        config_json: serde_json::Value,
        chain_id: u64,
        plugin: Arc<dyn DomainPlugin>,
        store: SharedStateStore,
        block_indexer: Arc<dyn BlockIndexer>,
        contracts: ContractRuntime,
        waiters: TransactionWaiters,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let (init_done, _) = watch::channel(false);
        Self {
            name,
            registry_address,
            config_json,
            chain_id,
            plugin,
            store,
            block_indexer,
            contracts,
            waiters,
            retry,
            cancel,
            initialized: AtomicBool::new(false),
            init_error: parking_lot::Mutex::new(None),
            init_done,
            init_handle: parking_lot::Mutex::new(None),
            schemas_by_id: parking_lot::Mutex::new(BTreeMap::new()),
            submit_config: parking_lot::Mutex::new(None),
            stream_name: parking_lot::Mutex::new(None),
        }
    }

    /// The domain name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registry address deployments are announced at.
    #[must_use]
    pub const fn registry_address(&self) -> Address {
        self.registry_address
    }

    /// Whether the init loop completed successfully.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// The init loop's terminal error, if it was cancelled.
    #[must_use]
    pub fn init_error(&self) -> Option<String> {
        self.init_error.lock().clone()
    }

    /// The registered event stream name, once init progressed that far.
    #[must_use]
    pub fn stream_name(&self) -> Option<String> {
        self.stream_name.lock().clone()
    }

    /// Suspend until initialization completes (or the scope cancels).
    pub async fn wait_initialized(&self) -> Result<()> {
        let mut done = self.init_done.subscribe();
        loop {
            if *done.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = done.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Cancelled);
                    }
                }
                () = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    fn check_init(&self) -> Result<()> {
        if self.initialized() {
            Ok(())
        } else {
            Err(EngineError::DomainNotInitialized(self.name.clone()))
        }
    }

    /// Cancel the domain's scope and join the init loop.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.init_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INIT LOOP
    // ═══════════════════════════════════════════════════════════════════════

    /// Spawn the init loop in the domain's scope.
    pub(crate) fn spawn_init(self: &Arc<Self>) {
        let domain = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let retry = domain.retry.clone();
            let cancel = domain.cancel.clone();
            let target = Arc::clone(&domain);
            let result = retry
                .run_indefinitely(&cancel, move |attempt| {
                    let domain = Arc::clone(&target);
                    async move {
                        debug!(domain = %domain.name, attempt, "initializing domain");
                        domain.init_once().await
                    }
                })
                .await;
            match result {
                Ok(()) => {
                    domain.initialized.store(true, Ordering::SeqCst);
                    // Latches exactly once; subscribers observe the flip
                    domain.init_done.send_replace(true);
                    info!(domain = %domain.name, "domain initialization complete");
                }
                Err(error) => {
                    debug!(domain = %domain.name, %error,
                           "domain initialization cancelled before completion");
                    *domain.init_error.lock() = Some(error.to_string());
                }
            }
        });
        *self.init_handle.lock() = Some(handle);
    }

    async fn init_once(self: &Arc<Self>) -> Result<()> {
        let response = self
            .plugin
            .configure_domain(pb::ConfigureDomainRequest {
                name: self.name.clone(),
                registry_contract_address: format!("{:#x}", self.registry_address),
                chain_id: self.chain_id,
                config_json: self.config_json.to_string(),
            })
            .await?;
        let init_request = self.process_domain_config(response).await?;
        self.plugin.init_domain(init_request).await?;
        Ok(())
    }

    /// Persist schemas and register the event stream from a configure
    /// response; returns the init request carrying the recorded schema IDs.
    async fn process_domain_config(
        self: &Arc<Self>,
        response: pb::ConfigureDomainResponse,
    ) -> Result<pb::InitDomainRequest> {
        let domain_config = response
            .domain_config
            .ok_or_else(|| EngineError::ConfigInvalid("domain returned no configuration".into()))?;
        let submit_config = domain_config.base_ledger_submit_config.clone().ok_or_else(|| {
            EngineError::ConfigInvalid("domain returned no base ledger submit config".into())
        })?;

        // Parse and record all schemas; duplicates collapse by signature
        let mut defs = Vec::with_capacity(domain_config.abi_state_schemas_json.len());
        for schema_json in &domain_config.abi_state_schemas_json {
            defs.push(SchemaDef::from_json(schema_json)?);
        }
        let schemas = self.store.ensure_abi_schemas(&self.name, &defs).await?;

        let mut refs = Vec::with_capacity(schemas.len());
        {
            let mut by_id = self.schemas_by_id.lock();
            for schema in &schemas {
                by_id.insert(schema.id_string(), schema.clone());
                refs.push(pb::StateSchemaRef {
                    id: schema.id_string(),
                    signature: schema.signature.clone(),
                });
            }
        }

        // Event stream: registry watcher plus the domain's own events ABI.
        // The name embeds the combined ABI hash so an ABI change yields a
        // fresh stream (and a replay); superseded streams are tombstoned.
        let mut sources = vec![EventStreamSource {
            address: Some(self.registry_address),
            abi_json: REGISTRY_ABI_JSON.to_string(),
        }];
        if !domain_config.abi_events_json.is_empty() {
            sources.push(EventStreamSource {
                address: None,
                abi_json: domain_config.abi_events_json.clone(),
            });
        }
        let mut hashes = Vec::with_capacity(sources.len() * 32);
        for source in &sources {
            hashes.extend_from_slice(abi_definition_hash(&source.abi_json)?.as_slice());
        }
        let stream_name = format!("domain_{}_{:x}", self.name, keccak256(&hashes));

        self.block_indexer
            .add_event_stream(
                EventStreamDefinition {
                    name: stream_name.clone(),
                    sources,
                },
                Arc::clone(self) as Arc<dyn EventStreamHandler>,
            )
            .await?;

        *self.submit_config.lock() = Some(submit_config);
        *self.stream_name.lock() = Some(stream_name);
        Ok(pb::InitDomainRequest {
            abi_state_schemas: refs,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATE QUERIES (domain callback path)
    // ═══════════════════════════════════════════════════════════════════════

    /// Service a `FindAvailableStates` callback within a fresh context.
    pub async fn find_available_states(
        &self,
        request: pb::FindAvailableStatesRequest,
    ) -> Result<pb::FindAvailableStatesResponse> {
        self.check_init()?;
        let contract: Address = request
            .contract_address
            .parse()
            .map_err(|_| EngineError::AddressInvalid(request.contract_address.clone()))?;
        // The schema must be one this domain registered at init
        if !self.schemas_by_id.lock().contains_key(&request.schema_id) {
            return Err(EngineError::State(
                paladin_state::StateError::SchemaNotFound(request.schema_id.clone()),
            ));
        }
        let schema_id: B256 = request
            .schema_id
            .parse()
            .map_err(|_| EngineError::State(paladin_state::StateError::SchemaNotFound(
                request.schema_id.clone(),
            )))?;
        let query = StateQuery::from_json(&request.query_json)?;

        let ctx = self.store.begin(&self.name, contract).await;
        let states = if request.use_nullifiers.unwrap_or(false) {
            ctx.find_available_nullifiers(schema_id, &query, None).await?
        } else {
            ctx.find_available_states(schema_id, &query, None).await?
        };

        Ok(pb::FindAvailableStatesResponse {
            states: states.into_iter().map(stored_state).collect(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TRANSACTION MEDIATION (stage engine path)
    // ═══════════════════════════════════════════════════════════════════════

    fn transaction_spec(
        &self,
        tx: &PrivateTransaction,
        contract: &PrivateContract,
    ) -> pb::TransactionSpecification {
        pb::TransactionSpecification {
            transaction_id: format!("{:#x}", tx.id_bytes32()),
            from: tx.from.clone(),
            contract_address: format!("{:#x}", contract.address),
            function_name: tx.function.clone(),
            function_params_json: tx.inputs.to_string(),
            contract_config: contract.config_hex(),
        }
    }

    async fn contract_of(&self, tx: &PrivateTransaction) -> Result<Arc<PrivateContract>> {
        let address = tx.contract.ok_or_else(|| EngineError::TxIncomplete {
            tx: tx.id,
            detail: "no contract address".into(),
        })?;
        self.contracts
            .get(address)
            .await?
            .ok_or_else(|| EngineError::ContractNotFound(format!("{address:#x}")))
    }

    /// Init: ask the domain which verifiers it needs resolved.
    pub async fn init_transaction(&self, tx: &mut PrivateTransaction) -> Result<()> {
        self.check_init()?;
        if tx.inputs.is_null() {
            return Err(EngineError::TxIncomplete {
                tx: tx.id,
                detail: "no inputs".into(),
            });
        }
        let contract = self.contract_of(tx).await?;
        let response = self
            .plugin
            .init_transaction(pb::InitTransactionRequest {
                transaction: Some(self.transaction_spec(tx, &contract)),
            })
            .await?;
        tx.required_verifiers = response.required_verifiers;
        Ok(())
    }

    /// Assemble: obtain states and the attestation plan, then lock inputs
    /// and upsert outputs in one domain context.
    ///
    /// No locks are held across the plugin call; mutations happen in a
    /// fresh context opened after it returns.
    #[instrument(skip_all, fields(domain = %self.name, tx = %tx.id))]
    pub async fn assemble_transaction(
        &self,
        tx: &mut PrivateTransaction,
    ) -> Result<AssembleOutcome> {
        self.check_init()?;
        let contract = self.contract_of(tx).await?;
        let response = self
            .plugin
            .assemble_transaction(pb::AssembleTransactionRequest {
                transaction: Some(self.transaction_spec(tx, &contract)),
                resolved_verifiers: tx.verifiers.clone(),
            })
            .await?;

        match response.assembly_result() {
            pb::assemble_transaction_response::AssemblyResult::Revert => {
                return Ok(AssembleOutcome::Revert(
                    response
                        .revert_reason
                        .unwrap_or_else(|| "assembly reverted".into()),
                ));
            }
            pb::assemble_transaction_response::AssemblyResult::Park => {
                return Ok(AssembleOutcome::Park);
            }
            pb::assemble_transaction_response::AssemblyResult::Ok => {}
        }

        let assembled = response.assembled_transaction.ok_or_else(|| {
            EngineError::TxIncomplete {
                tx: tx.id,
                detail: "assembly returned no states".into(),
            }
        })?;

        // Apply the assembly to the state store: new outputs (and info
        // states) are created under this transaction, inputs are locked for
        // spending. Contention with a concurrent assembly surfaces here as
        // an invalid transition, which parks the transaction for retry.
        let mut ctx = self.store.begin(&self.name, contract.address).await;
        let mut upserts = Vec::new();
        for new_state in assembled.output_states.iter().chain(&assembled.info_states) {
            upserts.push(StateUpsert {
                id: parse_optional_id(new_state.id.as_deref())?,
                schema_id: parse_b256(&new_state.schema_id)?,
                data: serde_json::from_str(&new_state.state_data_json)?,
                creating: true,
            });
        }
        if !upserts.is_empty() {
            ctx.upsert_states(Some(tx.id), upserts).await?;
        }
        let input_ids = assembled
            .input_states
            .iter()
            .map(|s| parse_b256(&s.id))
            .collect::<Result<Vec<_>>>()?;
        if !input_ids.is_empty() {
            if let Err(error) = ctx.lock_states_spending(tx.id, &input_ids).await {
                debug!(%error, "assembled inputs no longer available, parking");
                return Ok(AssembleOutcome::Park);
            }
        }
        ctx.commit().await?;

        tx.attestation_plan = response.attestation_plan;
        tx.assembled = Some(assembled);
        Ok(AssembleOutcome::Assembled)
    }

    /// Endorse: re-validate the assembled transaction with one endorser.
    pub async fn endorse_transaction(
        &self,
        tx: &PrivateTransaction,
        request: &pb::AttestationRequest,
        endorser: &pb::ResolvedVerifier,
    ) -> Result<EndorseOutcome> {
        self.check_init()?;
        let contract = self.contract_of(tx).await?;
        let assembled = tx.assembled.as_ref().ok_or_else(|| EngineError::TxIncomplete {
            tx: tx.id,
            detail: "not assembled".into(),
        })?;

        let response = self
            .plugin
            .endorse_transaction(pb::EndorseTransactionRequest {
                transaction: Some(self.transaction_spec(tx, &contract)),
                inputs: self.endorsable_inputs(&contract, assembled).await?,
                outputs: endorsable_new_states(&assembled.output_states),
                info: endorsable_new_states(&assembled.info_states),
                signatures: tx.attestations.clone(),
                resolved_verifiers: tx.verifiers.clone(),
                endorsement_request: Some(request.clone()),
                endorsement_verifier: endorser.verifier.clone(),
            })
            .await?;

        Ok(match response.endorsement_result() {
            pb::endorse_transaction_response::EndorsementResult::EndorserSubmit => {
                EndorseOutcome::Submit {
                    payload: response.payload.unwrap_or_default(),
                }
            }
            pb::endorse_transaction_response::EndorsementResult::EndorserSign => {
                EndorseOutcome::Sign {
                    payload: response.payload.unwrap_or_default(),
                }
            }
            pb::endorse_transaction_response::EndorsementResult::EndorserRevert
            | pb::endorse_transaction_response::EndorsementResult::Unspecified => {
                EndorseOutcome::Revert(
                    response
                        .revert_reason
                        .unwrap_or_else(|| "endorsement rejected".into()),
                )
            }
        })
    }

    /// Prepare: obtain the base-ledger artifact and select the signer.
    pub async fn prepare_transaction(&self, tx: &mut PrivateTransaction) -> Result<()> {
        self.check_init()?;
        let contract = self.contract_of(tx).await?;
        let assembled = tx.assembled.as_ref().ok_or_else(|| EngineError::TxIncomplete {
            tx: tx.id,
            detail: "not assembled".into(),
        })?;

        let response = self
            .plugin
            .prepare_transaction(pb::PrepareTransactionRequest {
                transaction: Some(self.transaction_spec(tx, &contract)),
                input_states: self.endorsable_inputs(&contract, assembled).await?,
                output_states: endorsable_new_states(&assembled.output_states),
                info_states: endorsable_new_states(&assembled.info_states),
                attestation_result: tx.attestations.clone(),
                resolved_verifiers: tx.verifiers.clone(),
            })
            .await?;

        let signer = self.select_signer(tx, response.signer.as_deref())?;
        let operation = ledger_operation(
            tx,
            response.transaction,
            response.deploy,
            contract.address,
        )?;
        tx.prepared = Some(PreparedLedgerTransaction { signer, operation });
        Ok(())
    }

    /// Deploy init: the domain names the verifiers it needs.
    pub async fn init_deploy(&self, tx: &mut PrivateTransaction) -> Result<()> {
        self.check_init()?;
        if tx.inputs.is_null() {
            return Err(EngineError::TxIncomplete {
                tx: tx.id,
                detail: "no constructor inputs".into(),
            });
        }
        let response = self
            .plugin
            .init_deploy(pb::InitDeployRequest {
                transaction: Some(self.deploy_spec(tx)),
            })
            .await?;
        tx.required_verifiers = response.required_verifiers;
        Ok(())
    }

    /// Deploy prepare: emit the base-ledger artifact for the deployment.
    pub async fn prepare_deploy(&self, tx: &mut PrivateTransaction) -> Result<()> {
        self.check_init()?;
        if tx.verifiers.is_empty() {
            return Err(EngineError::TxIncomplete {
                tx: tx.id,
                detail: "verifiers not resolved".into(),
            });
        }
        let response = self
            .plugin
            .prepare_deploy(pb::PrepareDeployRequest {
                transaction: Some(self.deploy_spec(tx)),
                resolved_verifiers: tx.verifiers.clone(),
            })
            .await?;

        let signer = self.select_signer(tx, response.signer.as_deref())?;
        // A deploy-mode invoke targets the domain's registry (factory)
        let operation = ledger_operation(
            tx,
            response.transaction,
            response.deploy,
            self.registry_address,
        )?;
        tx.prepared = Some(PreparedLedgerTransaction { signer, operation });
        Ok(())
    }

    fn deploy_spec(&self, tx: &PrivateTransaction) -> pb::DeployTransactionSpecification {
        pb::DeployTransactionSpecification {
            transaction_id: format!("{:#x}", tx.id_bytes32()),
            constructor_params_json: tx.inputs.to_string(),
        }
    }

    /// Prefer the domain's signer; fall back per the submit mode.
    fn select_signer(&self, tx: &PrivateTransaction, signer: Option<&str>) -> Result<String> {
        if let Some(signer) = signer.filter(|s| !s.is_empty()) {
            return Ok(signer.to_string());
        }
        let submit = self.submit_config.lock().clone().ok_or_else(|| {
            EngineError::DomainNotInitialized(self.name.clone())
        })?;
        match submit.submit_mode() {
            pb::base_ledger_submit_config::SubmitMode::OneTimeUseKeys => {
                Ok(format!("{}{}", submit.one_time_use_prefix, tx.id))
            }
            other => Err(EngineError::NoSigner(format!("{other:?}"))),
        }
    }

    async fn endorsable_inputs(
        &self,
        contract: &PrivateContract,
        assembled: &pb::AssembledTransaction,
    ) -> Result<Vec<pb::EndorsableState>> {
        let ids = assembled
            .input_states
            .iter()
            .map(|s| parse_b256(&s.id))
            .collect::<Result<Vec<_>>>()?;
        let ctx = self.store.begin(&self.name, contract.address).await;
        let states = ctx.get_states(&ids).await?;
        Ok(states
            .into_iter()
            .map(|state| pb::EndorsableState {
                id: state.id_string(),
                schema_id: format!("0x{}", hex::encode(state.schema_id)),
                state_data_json: state.data.to_string(),
            })
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // EVENT HANDLING
    // ═══════════════════════════════════════════════════════════════════════

    /// Index registrations at the registry address; returns the deploy
    /// transaction IDs to complete after commit.
    async fn registration_indexer(&self, events: &[LedgerEvent]) -> Result<Vec<Uuid>> {
        let mut registered = Vec::new();
        for event in events {
            if event.event_name != REGISTRATION_EVENT {
                continue;
            }
            let at_registry = event
                .address
                .parse::<Address>()
                .is_ok_and(|a| a == self.registry_address);
            if !at_registry {
                continue;
            }
            let instance: Address = event
                .data
                .get("instance")
                .and_then(serde_json::Value::as_str)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    EngineError::AddressInvalid("registration without instance".into())
                })?;
            let config_bytes = event
                .data
                .get("config")
                .and_then(serde_json::Value::as_str)
                .map(|s| hex::decode(s.trim_start_matches("0x")))
                .transpose()
                .map_err(|e| EngineError::Internal(format!("malformed config bytes: {e}")))?
                .unwrap_or_default();
            self.contracts
                .register(instance, &self.name, config_bytes)
                .await?;
            if let Some(tx_hex) = event.data.get("txId").and_then(serde_json::Value::as_str) {
                registered.push(tx_id_from_bytes32(tx_hex)?);
            }
            info!(domain = %self.name, %instance, "indexed private contract registration");
        }
        Ok(registered)
    }

    async fn group_events_by_contract(
        &self,
        events: &[LedgerEvent],
    ) -> Result<BTreeMap<Address, (Vec<LedgerEvent>, String)>> {
        let mut groups: BTreeMap<Address, (Vec<LedgerEvent>, String)> = BTreeMap::new();
        for event in events {
            if event.event_name == REGISTRATION_EVENT {
                continue;
            }
            let Ok(address) = event.address.parse::<Address>() else {
                continue;
            };
            // Hits are cached; events from unrecognized contracts always
            // cost a store lookup.
            let Some(contract) = self.contracts.get(address).await? else {
                debug!(%address, "event from unrecognized contract");
                continue;
            };
            if contract.domain != self.name {
                continue;
            }
            groups
                .entry(address)
                .or_insert_with(|| (Vec::new(), contract.config_hex()))
                .0
                .push(event.clone());
        }
        Ok(groups)
    }

    async fn apply_contract_batch(
        &self,
        batch_id: Uuid,
        address: Address,
        events: Vec<LedgerEvent>,
        config_hex: String,
    ) -> Result<Vec<Uuid>> {
        let response = self
            .plugin
            .handle_event_batch(pb::HandleEventBatchRequest {
                batch_id: batch_id.to_string(),
                json_events: serde_json::to_string(&events)?,
                config_bytes: config_hex,
            })
            .await?;

        // One domain context per contract: upserts, then spends, then
        // confirmations, committed atomically.
        let mut ctx = self.store.begin(&self.name, address).await;
        for new_state in &response.new_states {
            let tx = tx_id_from_bytes32(&new_state.transaction_id)?;
            ctx.upsert_states(
                Some(tx),
                vec![StateUpsert {
                    id: parse_optional_id(new_state.id.as_deref())?,
                    schema_id: parse_b256(&new_state.schema_id)?,
                    data: serde_json::from_str(&new_state.state_data_json)?,
                    creating: true,
                }],
            )
            .await?;
        }
        for update in &response.spent_states {
            let tx = tx_id_from_bytes32(&update.transaction_id)?;
            let id = parse_b256(&update.id)?;
            if ctx.get_states(&[id]).await?.is_empty() {
                // The spend is real on the ledger, but this node holds no
                // private data for the state; it becomes relevant only if
                // the data ever arrives.
                debug!(state = %update.id, "spend of state with no local data");
                continue;
            }
            ctx.mark_states_spent(tx, &[id]).await?;
        }
        for update in &response.confirmed_states {
            let tx = tx_id_from_bytes32(&update.transaction_id)?;
            let id = parse_b256(&update.id)?;
            if ctx.get_states(&[id]).await?.is_empty() {
                debug!(state = %update.id, "confirmation of state with no local data");
                continue;
            }
            ctx.mark_states_confirmed(tx, &[id]).await?;
        }
        ctx.commit().await?;

        response
            .transactions_complete
            .iter()
            .map(|tx_hex| tx_id_from_bytes32(tx_hex))
            .collect()
    }
}

#[async_trait]
impl EventStreamHandler for Domain {
    #[instrument(skip_all, fields(domain = %self.name, batch = %batch.batch_id))]
    async fn handle_event_batch(&self, batch: EventDeliveryBatch) -> Result<PostCommit> {
        // Registrations first: later events in the same batch may target
        // the contracts they announce.
        let mut completed = self.registration_indexer(&batch.events).await?;

        let groups = self.group_events_by_contract(&batch.events).await?;
        for (address, (events, config_hex)) in groups {
            completed.extend(
                self.apply_contract_batch(batch.batch_id, address, events, config_hex)
                    .await?,
            );
        }

        let waiters = self.waiters.clone();
        Ok(Box::new(move || {
            for tx_id in completed {
                waiters.complete(tx_id);
            }
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Keccak of the canonical form of an ABI document.
pub(crate) fn abi_definition_hash(abi_json: &str) -> Result<B256> {
    let parsed: serde_json::Value = serde_json::from_str(abi_json)
        .map_err(|e| EngineError::AbiInvalid(format!("events ABI: {e}")))?;
    Ok(keccak256(canonical_json(&parsed).as_bytes()))
}

fn parse_b256(hex_id: &str) -> Result<B256> {
    hex_id
        .parse()
        .map_err(|e| EngineError::Internal(format!("malformed 32-byte ID {hex_id:?}: {e}")))
}

fn parse_optional_id(id: Option<&str>) -> Result<Option<B256>> {
    id.map(parse_b256).transpose()
}

fn endorsable_new_states(states: &[pb::NewState]) -> Vec<pb::EndorsableState> {
    states
        .iter()
        .map(|s| pb::EndorsableState {
            id: s.id.clone().unwrap_or_default(),
            schema_id: s.schema_id.clone(),
            state_data_json: s.state_data_json.clone(),
        })
        .collect()
}

fn stored_state(state: paladin_state::StateRecord) -> pb::StoredState {
    pb::StoredState {
        id: state.id_string(),
        schema_id: format!("0x{}", hex::encode(state.schema_id)),
        stored_at: state.created_at.timestamp_micros(),
        data_json: state.data.to_string(),
        lock: state.lock.map(|lock| pb::StateLockInfo {
            transaction: lock.tx_id.to_string(),
            creating: lock.creating,
            spending: lock.spending,
        }),
    }
}

/// Exactly one of invoke/deploy must be returned by a prepare.
fn ledger_operation(
    tx: &PrivateTransaction,
    invoke: Option<pb::BaseLedgerTransaction>,
    deploy: Option<pb::BaseLedgerDeployTransaction>,
    invoke_target: Address,
) -> Result<LedgerOperation> {
    match (invoke, deploy) {
        (Some(invoke), None) => {
            // Validate the ABI entry eagerly so a malformed factory ABI is
            // a prepare failure, not a submission-time surprise
            serde_json::from_str::<alloy::json_abi::Function>(&invoke.function_abi_json)
                .map_err(|e| EngineError::AbiInvalid(format!("function ABI: {e}")))?;
            Ok(LedgerOperation::Invoke {
                to: invoke_target,
                function_abi_json: invoke.function_abi_json,
                params_json: invoke.params_json,
            })
        }
        (None, Some(deploy)) => {
            if !deploy.constructor_abi_json.is_empty() {
                serde_json::from_str::<alloy::json_abi::Constructor>(&deploy.constructor_abi_json)
                    .map_err(|e| EngineError::AbiInvalid(format!("constructor ABI: {e}")))?;
            }
            Ok(LedgerOperation::Deploy {
                constructor_abi_json: deploy.constructor_abi_json,
                bytecode: deploy.bytecode,
                params_json: deploy.params_json,
            })
        }
        _ => {
            debug!(tx = %tx.id, "prepare returned both or neither of invoke/deploy");
            Err(EngineError::PrepareAmbiguous)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_hash_is_stable_under_formatting() {
        let a = r#"[{"type":"event","name":"X","inputs":[]}]"#;
        let b = "[ { \"name\": \"X\", \"type\": \"event\", \"inputs\": [] } ]";
        assert_eq!(
            abi_definition_hash(a).unwrap(),
            abi_definition_hash(b).unwrap()
        );
        let c = r#"[{"type":"event","name":"Y","inputs":[]}]"#;
        assert_ne!(
            abi_definition_hash(a).unwrap(),
            abi_definition_hash(c).unwrap()
        );
    }

    #[test]
    fn prepare_requires_exactly_one_operation() {
        let tx = PrivateTransaction::invoke(
            "noto",
            Address::ZERO,
            "alice",
            "burn",
            serde_json::json!({}),
        );
        let invoke = pb::BaseLedgerTransaction {
            function_abi_json: r#"{"type":"function","name":"transfer","inputs":[]}"#.into(),
            params_json: "{}".into(),
        };
        let deploy = pb::BaseLedgerDeployTransaction {
            constructor_abi_json: String::new(),
            bytecode: "0x00".into(),
            params_json: "{}".into(),
        };

        assert!(ledger_operation(&tx, Some(invoke.clone()), None, Address::ZERO).is_ok());
        assert!(ledger_operation(&tx, None, Some(deploy.clone()), Address::ZERO).is_ok());
        assert!(matches!(
            ledger_operation(&tx, Some(invoke), Some(deploy.clone()), Address::ZERO),
            Err(EngineError::PrepareAmbiguous)
        ));
        assert!(matches!(
            ledger_operation(&tx, None, None, Address::ZERO),
            Err(EngineError::PrepareAmbiguous)
        ));
    }
}
