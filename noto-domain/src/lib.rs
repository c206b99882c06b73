//! Noto: a notarized fungible-token domain.
//!
//! Value lives in UTXO-style coin states `{salt, owner, amount}`. Every
//! transaction is assembled from the sender's available coins, signed by the
//! sender over the unmasked transfer encoding, endorsed by the token's
//! notary, and settled on the base ledger as a masked `transfer(...)` invoke
//! that carries only state IDs.
//!
//! The domain implements [`DomainPlugin`] directly, so it can be wired
//! in-process (as the engine's integration tests do) or hosted behind the
//! plugin controller's gRPC bridge unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use paladin_plugin::{pb, DomainCallbacks, DomainPlugin, LedgerEvent, PluginError};

pub mod abi;
pub mod coins;
pub mod config;
pub mod error;
mod handlers;

pub use config::NotoConfig;
pub use error::{NotoError, Result};

use handlers::ParsedTransaction;

// ═══════════════════════════════════════════════════════════════════════════════
// DOMAIN
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Configured {
    name: String,
    chain_id: u64,
    coin_schema_id: Option<String>,
}

/// The Noto domain implementation.
pub struct Noto {
    callbacks: Arc<dyn DomainCallbacks>,
    configured: RwLock<Option<Configured>>,
}

impl std::fmt::Debug for Noto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Noto").finish_non_exhaustive()
    }
}

impl Noto {
    /// Create the domain over the engine's callback surface.
    #[must_use]
    pub fn new(callbacks: Arc<dyn DomainCallbacks>) -> Self {
        Self {
            callbacks,
            configured: RwLock::new(None),
        }
    }

    pub(crate) fn callbacks(&self) -> &Arc<dyn DomainCallbacks> {
        &self.callbacks
    }

    /// The recorded coin schema ID; available once init completed.
    pub(crate) async fn coin_schema_id(&self) -> Result<String> {
        self.configured
            .read()
            .await
            .as_ref()
            .and_then(|c| c.coin_schema_id.clone())
            .ok_or(NotoError::NotConfigured)
    }
}

type PluginResult<T> = std::result::Result<T, PluginError>;

#[async_trait]
impl DomainPlugin for Noto {
    #[instrument(skip_all, fields(domain = %request.name))]
    async fn configure_domain(
        &self,
        request: pb::ConfigureDomainRequest,
    ) -> PluginResult<pb::ConfigureDomainResponse> {
        info!(chain_id = request.chain_id, "configuring noto domain");
        *self.configured.write().await = Some(Configured {
            name: request.name,
            chain_id: request.chain_id,
            coin_schema_id: None,
        });
        Ok(pb::ConfigureDomainResponse {
            domain_config: Some(pb::DomainConfig {
                abi_state_schemas_json: vec![config::NOTO_COIN_SCHEMA_JSON.to_string()],
                abi_events_json: config::NOTO_EVENTS_ABI_JSON.to_string(),
                base_ledger_submit_config: Some(pb::BaseLedgerSubmitConfig {
                    submit_mode: pb::base_ledger_submit_config::SubmitMode::OneTimeUseKeys
                        as i32,
                    one_time_use_prefix: config::ONE_TIME_USE_PREFIX.to_string(),
                }),
            }),
        })
    }

    async fn init_domain(
        &self,
        request: pb::InitDomainRequest,
    ) -> PluginResult<pb::InitDomainResponse> {
        let schema_id = request
            .abi_state_schemas
            .first()
            .map(|s| s.id.clone())
            .ok_or_else(|| PluginError::Domain("no schemas recorded for noto".into()))?;
        let mut configured = self.configured.write().await;
        match configured.as_mut() {
            Some(state) => {
                state.coin_schema_id = Some(schema_id);
                debug!(domain = %state.name, chain_id = state.chain_id, "noto domain initialized");
            }
            None => return Err(NotoError::NotConfigured.into()),
        }
        Ok(pb::InitDomainResponse {})
    }

    async fn init_deploy(
        &self,
        request: pb::InitDeployRequest,
    ) -> PluginResult<pb::InitDeployResponse> {
        let spec = request
            .transaction
            .ok_or_else(|| PluginError::Domain("missing deploy specification".into()))?;
        let config = deploy_config(&spec).map_err(PluginError::from)?;
        Ok(pb::InitDeployResponse {
            required_verifiers: vec![pb::ResolveVerifierRequest {
                lookup: config.notary,
                algorithm: paladin_keys::algorithms::ECDSA_SECP256K1.into(),
                verifier_type: paladin_keys::algorithms::VERIFIER_ETH_ADDRESS.into(),
            }],
        })
    }

    async fn prepare_deploy(
        &self,
        request: pb::PrepareDeployRequest,
    ) -> PluginResult<pb::PrepareDeployResponse> {
        let spec = request
            .transaction
            .ok_or_else(|| PluginError::Domain("missing deploy specification".into()))?;
        let config = deploy_config(&spec).map_err(PluginError::from)?;
        let notary_address =
            handlers::find_eth_verifier(&config.notary, &request.resolved_verifiers)
                .map_err(PluginError::from)?;

        let params = serde_json::json!({
            "txId": spec.transaction_id,
            "notary": format!("{notary_address:#x}"),
            "config": config.to_config_hex(),
        });
        Ok(pb::PrepareDeployResponse {
            transaction: Some(pb::BaseLedgerTransaction {
                function_abi_json: abi::DEPLOY_FN_ABI_JSON.to_string(),
                params_json: params.to_string(),
            }),
            deploy: None,
            signer: None,
        })
    }

    async fn init_transaction(
        &self,
        request: pb::InitTransactionRequest,
    ) -> PluginResult<pb::InitTransactionResponse> {
        let tx = parse_spec(request.transaction.as_ref())?;
        tx.handler().init(&tx, &request).map_err(PluginError::from)
    }

    #[instrument(skip_all, fields(tx = tracing::field::Empty))]
    async fn assemble_transaction(
        &self,
        request: pb::AssembleTransactionRequest,
    ) -> PluginResult<pb::AssembleTransactionResponse> {
        let tx = parse_spec(request.transaction.as_ref())?;
        tracing::Span::current().record("tx", tx.id.as_str());
        tx.handler()
            .assemble(self, &tx, &request)
            .await
            .map_err(PluginError::from)
    }

    async fn endorse_transaction(
        &self,
        request: pb::EndorseTransactionRequest,
    ) -> PluginResult<pb::EndorseTransactionResponse> {
        let tx = parse_spec(request.transaction.as_ref())?;
        tx.handler()
            .endorse(self, &tx, &request)
            .await
            .map_err(PluginError::from)
    }

    async fn prepare_transaction(
        &self,
        request: pb::PrepareTransactionRequest,
    ) -> PluginResult<pb::PrepareTransactionResponse> {
        let tx = parse_spec(request.transaction.as_ref())?;
        tx.handler()
            .prepare(self, &tx, &request)
            .await
            .map_err(PluginError::from)
    }

    #[instrument(skip_all, fields(batch = %request.batch_id))]
    async fn handle_event_batch(
        &self,
        request: pb::HandleEventBatchRequest,
    ) -> PluginResult<pb::HandleEventBatchResponse> {
        let events: Vec<LedgerEvent> = serde_json::from_str(&request.json_events)
            .map_err(|e| PluginError::Domain(format!("malformed event batch: {e}")))?;

        let mut response = pb::HandleEventBatchResponse {
            spent_states: Vec::new(),
            confirmed_states: Vec::new(),
            new_states: Vec::new(),
            transactions_complete: Vec::new(),
        };
        for event in events {
            if event.event_name != "NotoTransfer" {
                debug!(event = %event.event_name, "ignoring unrecognized event");
                continue;
            }
            let tx_id = event
                .data
                .get("data")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| {
                    PluginError::Domain("NotoTransfer event missing data field".into())
                })?
                .to_string();
            for input in string_array(&event.data, "inputs") {
                response.spent_states.push(pb::StateUpdate {
                    id: input,
                    transaction_id: tx_id.clone(),
                });
            }
            for output in string_array(&event.data, "outputs") {
                response.confirmed_states.push(pb::StateUpdate {
                    id: output,
                    transaction_id: tx_id.clone(),
                });
            }
            response.transactions_complete.push(tx_id);
        }
        Ok(response)
    }

    async fn get_verifier(
        &self,
        request: pb::GetVerifierRequest,
    ) -> PluginResult<pb::GetVerifierResponse> {
        Err(PluginError::Domain(format!(
            "noto has no domain-side verifiers for algorithm {}",
            request.algorithm
        )))
    }

    async fn sign(&self, request: pb::SignRequest) -> PluginResult<pb::SignResponse> {
        Err(PluginError::Domain(format!(
            "noto has no domain-side keys for algorithm {}",
            request.algorithm
        )))
    }
}

fn parse_spec(
    spec: Option<&pb::TransactionSpecification>,
) -> PluginResult<ParsedTransaction> {
    let spec = spec.ok_or_else(|| PluginError::Domain("missing transaction".into()))?;
    ParsedTransaction::parse(spec).map_err(PluginError::from)
}

fn deploy_config(spec: &pb::DeployTransactionSpecification) -> Result<NotoConfig> {
    NotoConfig::from_json(&spec.constructor_params_json)
}

fn string_array(data: &serde_json::Value, field: &str) -> Vec<String> {
    data.get(field)
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256, U256};
    use coins::NotoCoin;
    use paladin_state::state::state_id;
    use serde_json::json;

    const ALICE: Address = Address::repeat_byte(0xAA);
    const CONTRACT: Address = Address::repeat_byte(0xC0);

    /// Callbacks backed by a fixed set of available coin states.
    struct FixedStates {
        schema_id: B256,
        coins: Vec<NotoCoin>,
    }

    #[async_trait]
    impl DomainCallbacks for FixedStates {
        async fn find_available_states(
            &self,
            _request: pb::FindAvailableStatesRequest,
        ) -> paladin_plugin::Result<pb::FindAvailableStatesResponse> {
            Ok(pb::FindAvailableStatesResponse {
                states: self
                    .coins
                    .iter()
                    .map(|coin| {
                        let data = coin.to_data_json();
                        pb::StoredState {
                            id: format!("{:#x}", state_id(self.schema_id, &data)),
                            schema_id: format!("{:#x}", self.schema_id),
                            stored_at: 0,
                            data_json: data.to_string(),
                            lock: None,
                        }
                    })
                    .collect(),
            })
        }

        async fn encode_data(
            &self,
            _request: pb::EncodeDataRequest,
        ) -> paladin_plugin::Result<pb::EncodeDataResponse> {
            unimplemented!("not used in these tests")
        }

        async fn recover_signer(
            &self,
            _request: pb::RecoverSignerRequest,
        ) -> paladin_plugin::Result<pb::RecoverSignerResponse> {
            unimplemented!("not used in these tests")
        }
    }

    async fn configured_noto(coins: Vec<NotoCoin>) -> Noto {
        let schema = paladin_state::Schema::parse(
            "noto",
            paladin_state::SchemaDef::from_json(config::NOTO_COIN_SCHEMA_JSON).unwrap(),
        )
        .unwrap();
        let noto = Noto::new(Arc::new(FixedStates {
            schema_id: schema.id,
            coins,
        }));
        noto.configure_domain(pb::ConfigureDomainRequest {
            name: "noto".into(),
            registry_contract_address: String::new(),
            chain_id: 1337,
            config_json: "{}".into(),
        })
        .await
        .unwrap();
        noto.init_domain(pb::InitDomainRequest {
            abi_state_schemas: vec![pb::StateSchemaRef {
                id: format!("{:#x}", schema.id),
                signature: schema.signature,
            }],
        })
        .await
        .unwrap();
        noto
    }

    fn burn_spec(amount: u64) -> pb::TransactionSpecification {
        let config = NotoConfig {
            notary: "notary".into(),
            allow_burn: true,
            restrict_mint: true,
        };
        pb::TransactionSpecification {
            transaction_id: format!("{:#x}", B256::repeat_byte(0x7e)),
            from: "alice".into(),
            contract_address: format!("{CONTRACT:#x}"),
            function_name: "burn".into(),
            function_params_json: json!({"amount": amount.to_string()}).to_string(),
            contract_config: config.to_config_hex(),
        }
    }

    fn resolved_alice() -> Vec<pb::ResolvedVerifier> {
        vec![pb::ResolvedVerifier {
            lookup: "alice".into(),
            algorithm: paladin_keys::algorithms::ECDSA_SECP256K1.into(),
            verifier_type: paladin_keys::algorithms::VERIFIER_ETH_ADDRESS.into(),
            verifier: format!("{ALICE:#x}"),
        }]
    }

    #[tokio::test]
    async fn burn_selects_inputs_and_returns_change() {
        let noto = configured_noto(vec![
            NotoCoin::new_random(ALICE, U256::from(500)),
            NotoCoin::new_random(ALICE, U256::from(700)),
        ])
        .await;

        let response = noto
            .assemble_transaction(pb::AssembleTransactionRequest {
                transaction: Some(burn_spec(900)),
                resolved_verifiers: resolved_alice(),
            })
            .await
            .unwrap();

        assert_eq!(
            response.assembly_result,
            pb::assemble_transaction_response::AssemblyResult::Ok as i32
        );
        let assembled = response.assembled_transaction.unwrap();
        assert_eq!(assembled.input_states.len(), 2);
        assert_eq!(assembled.output_states.len(), 1);
        let change: serde_json::Value =
            serde_json::from_str(&assembled.output_states[0].state_data_json).unwrap();
        assert_eq!(change["amount"], "300");

        // plan: sender signs, notary endorses
        assert_eq!(response.attestation_plan.len(), 2);
        assert_eq!(response.attestation_plan[0].name, "sender");
        assert_eq!(
            response.attestation_plan[0].attestation_type,
            pb::AttestationType::Sign as i32
        );
        assert_eq!(response.attestation_plan[1].name, "notary");
        assert_eq!(
            response.attestation_plan[1].attestation_type,
            pb::AttestationType::Endorse as i32
        );
    }

    #[tokio::test]
    async fn burn_reverts_when_funds_insufficient() {
        let noto = configured_noto(vec![NotoCoin::new_random(ALICE, U256::from(100))]).await;
        let response = noto
            .assemble_transaction(pb::AssembleTransactionRequest {
                transaction: Some(burn_spec(900)),
                resolved_verifiers: resolved_alice(),
            })
            .await
            .unwrap();
        assert_eq!(
            response.assembly_result,
            pb::assemble_transaction_response::AssemblyResult::Revert as i32
        );
        let reason = response.revert_reason.unwrap();
        assert!(reason.contains("insufficient"), "got: {reason}");
        assert!(reason.contains("needed 900"), "got: {reason}");
        assert!(reason.contains("available 100"), "got: {reason}");
    }

    #[tokio::test]
    async fn event_batch_maps_transfer_to_state_updates() {
        let noto = configured_noto(vec![]).await;
        let tx_id = format!("{:#x}", B256::repeat_byte(0x7e));
        let events = serde_json::to_string(&vec![LedgerEvent {
            address: format!("{CONTRACT:#x}"),
            block_number: 10,
            log_index: 0,
            transaction_hash: format!("{:#x}", B256::repeat_byte(1)),
            event_name: "NotoTransfer".into(),
            data: json!({
                "inputs": [format!("{:#x}", B256::repeat_byte(2))],
                "outputs": [format!("{:#x}", B256::repeat_byte(3))],
                "data": tx_id,
            }),
        }])
        .unwrap();

        let response = noto
            .handle_event_batch(pb::HandleEventBatchRequest {
                batch_id: "batch-1".into(),
                json_events: events,
                config_bytes: String::new(),
            })
            .await
            .unwrap();

        assert_eq!(response.spent_states.len(), 1);
        assert_eq!(response.confirmed_states.len(), 1);
        assert_eq!(response.transactions_complete, vec![tx_id]);
    }

    #[tokio::test]
    async fn unknown_function_rejected() {
        let noto = configured_noto(vec![]).await;
        let mut spec = burn_spec(1);
        spec.function_name = "melt".into();
        let err = noto
            .init_transaction(pb::InitTransactionRequest {
                transaction: Some(spec),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown function"));
    }
}
