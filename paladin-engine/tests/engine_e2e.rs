//! End-to-end engine scenarios over the in-process Noto domain.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use alloy::primitives::U256;
use async_trait::async_trait;
use serde_json::json;

use common::{setup, REGISTRY};
use paladin_engine::domains::DomainManager;
use paladin_engine::indexer::ManualBlockIndexer;
use paladin_engine::ports::BlockIndexer;
use paladin_engine::retry::RetryPolicy;
use paladin_engine::sequencer::TxOutcome;
use paladin_engine::types::LedgerOperation;
use paladin_plugin::{pb, DomainPlugin, PluginError};
use paladin_state::{MemoryBackend, StateBackend, StateStore};

// ═══════════════════════════════════════════════════════════════════════════════
// BURN PATH
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn burn_spends_inputs_and_returns_change() {
    let harness = setup().await;
    let contract = harness.deploy_token("notary").await;

    // Contract discovered through the registration indexer
    assert!(harness
        .manager
        .contracts()
        .get(contract)
        .await
        .unwrap()
        .is_some());

    // Seed two coins via the full mint lifecycle
    assert_eq!(
        harness.mint(contract, "notary", "alice", 500).await,
        TxOutcome::Complete
    );
    assert_eq!(
        harness.mint(contract, "notary", "alice", 700).await,
        TxOutcome::Complete
    );
    assert_eq!(
        harness.available_amounts(contract, "alice").await,
        vec![U256::from(500), U256::from(700)]
    );

    // Burn 900: both coins consumed, 300 change returned to alice
    assert_eq!(
        harness.burn(contract, "alice", 900).await,
        TxOutcome::Complete
    );
    assert_eq!(
        harness.available_amounts(contract, "alice").await,
        vec![U256::from(300)]
    );

    // The prepared artifact was a transfer invoke of the settlement
    // contract with two inputs and one output
    let submissions = harness.ledger.submissions.lock();
    let (_, last) = submissions.last().unwrap();
    let LedgerOperation::Invoke {
        to,
        function_abi_json,
        params_json,
    } = &last.operation
    else {
        panic!("expected an invoke");
    };
    assert_eq!(*to, contract);
    let function: serde_json::Value = serde_json::from_str(function_abi_json).unwrap();
    assert_eq!(function["name"], "transfer");
    let params: serde_json::Value = serde_json::from_str(params_json).unwrap();
    assert_eq!(params["inputs"].as_array().unwrap().len(), 2);
    assert_eq!(params["outputs"].as_array().unwrap().len(), 1);
    assert!(params["signature"].as_str().unwrap().starts_with("0x"));
}

#[tokio::test]
async fn burn_beyond_balance_reverts() {
    let harness = setup().await;
    let contract = harness.deploy_token("notary").await;
    harness.mint(contract, "notary", "alice", 100).await;

    let outcome = harness.burn(contract, "alice", 900).await;
    match outcome {
        TxOutcome::Reverted(reason) => assert!(reason.contains("insufficient"), "got: {reason}"),
        other => panic!("expected revert, got {other:?}"),
    }
    // Nothing was consumed
    assert_eq!(
        harness.available_amounts(contract, "alice").await,
        vec![U256::from(100)]
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOUBLE SPEND
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_burns_cannot_both_spend_one_coin() {
    let harness = setup().await;
    let contract = harness.deploy_token("notary").await;
    harness.mint(contract, "notary", "alice", 500).await;

    // Two transactions race to spend the single 500 coin
    let (first, second) = tokio::join!(
        harness.burn(contract, "alice", 500),
        harness.burn(contract, "alice", 500),
    );

    let completed = [&first, &second]
        .iter()
        .filter(|o| ***o == TxOutcome::Complete)
        .count();
    let reverted = [&first, &second]
        .iter()
        .filter(|o| matches!(o, TxOutcome::Reverted(_)))
        .count();
    assert_eq!(completed, 1, "exactly one burn wins: {first:?} / {second:?}");
    assert_eq!(reverted, 1, "the loser reverts: {first:?} / {second:?}");

    // The coin is gone either way
    assert!(harness.available_amounts(contract, "alice").await.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════════
// INIT RETRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Fails `configure_domain` a fixed number of times before delegating.
struct Flaky<D> {
    failures: AtomicU32,
    attempts: AtomicU32,
    inner: D,
}

#[async_trait]
impl<D: DomainPlugin> DomainPlugin for Flaky<D> {
    async fn configure_domain(
        &self,
        request: pb::ConfigureDomainRequest,
    ) -> Result<pb::ConfigureDomainResponse, PluginError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures.load(Ordering::SeqCst) {
            return Err(PluginError::Transport(format!(
                "flaky failure on attempt {attempt}"
            )));
        }
        self.inner.configure_domain(request).await
    }

    async fn init_domain(
        &self,
        request: pb::InitDomainRequest,
    ) -> Result<pb::InitDomainResponse, PluginError> {
        self.inner.init_domain(request).await
    }

    async fn init_deploy(
        &self,
        request: pb::InitDeployRequest,
    ) -> Result<pb::InitDeployResponse, PluginError> {
        self.inner.init_deploy(request).await
    }

    async fn prepare_deploy(
        &self,
        request: pb::PrepareDeployRequest,
    ) -> Result<pb::PrepareDeployResponse, PluginError> {
        self.inner.prepare_deploy(request).await
    }

    async fn init_transaction(
        &self,
        request: pb::InitTransactionRequest,
    ) -> Result<pb::InitTransactionResponse, PluginError> {
        self.inner.init_transaction(request).await
    }

    async fn assemble_transaction(
        &self,
        request: pb::AssembleTransactionRequest,
    ) -> Result<pb::AssembleTransactionResponse, PluginError> {
        self.inner.assemble_transaction(request).await
    }

    async fn endorse_transaction(
        &self,
        request: pb::EndorseTransactionRequest,
    ) -> Result<pb::EndorseTransactionResponse, PluginError> {
        self.inner.endorse_transaction(request).await
    }

    async fn prepare_transaction(
        &self,
        request: pb::PrepareTransactionRequest,
    ) -> Result<pb::PrepareTransactionResponse, PluginError> {
        self.inner.prepare_transaction(request).await
    }

    async fn handle_event_batch(
        &self,
        request: pb::HandleEventBatchRequest,
    ) -> Result<pb::HandleEventBatchResponse, PluginError> {
        self.inner.handle_event_batch(request).await
    }

    async fn get_verifier(
        &self,
        request: pb::GetVerifierRequest,
    ) -> Result<pb::GetVerifierResponse, PluginError> {
        self.inner.get_verifier(request).await
    }

    async fn sign(&self, request: pb::SignRequest) -> Result<pb::SignResponse, PluginError> {
        self.inner.sign(request).await
    }
}

#[tokio::test]
async fn init_retries_until_configure_succeeds() {
    let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
    let indexer = Arc::new(ManualBlockIndexer::new());
    let manager = DomainManager::new(
        1337,
        StateStore::from_arc(backend),
        Arc::clone(&indexer) as Arc<dyn BlockIndexer>,
        RetryPolicy::fast(),
    );

    let flaky = Arc::new(Flaky {
        failures: AtomicU32::new(3),
        attempts: AtomicU32::new(0),
        inner: noto_domain::Noto::new(Arc::new(manager.clone())),
    });
    let domain = manager.register_domain("noto", REGISTRY, json!({}), flaky.clone());

    domain.wait_initialized().await.unwrap();
    assert!(domain.initialized());
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 4);

    // The init-done latch fired exactly once; closing joins the loop and a
    // later wait returns immediately
    domain.close().await;
    assert!(domain.initialized());
    assert!(domain.init_error().is_none());
    domain.wait_initialized().await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCHEMA CHANGE → NEW STREAM
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimal domain returning a fixed events ABI from configuration.
struct FixedAbiDomain {
    events_abi: String,
}

#[async_trait]
impl DomainPlugin for FixedAbiDomain {
    async fn configure_domain(
        &self,
        _request: pb::ConfigureDomainRequest,
    ) -> Result<pb::ConfigureDomainResponse, PluginError> {
        Ok(pb::ConfigureDomainResponse {
            domain_config: Some(pb::DomainConfig {
                abi_state_schemas_json: vec![
                    noto_domain::config::NOTO_COIN_SCHEMA_JSON.to_string()
                ],
                abi_events_json: self.events_abi.clone(),
                base_ledger_submit_config: Some(pb::BaseLedgerSubmitConfig {
                    submit_mode: pb::base_ledger_submit_config::SubmitMode::OneTimeUseKeys as i32,
                    one_time_use_prefix: "oneuse/".into(),
                }),
            }),
        })
    }

    async fn init_domain(
        &self,
        _request: pb::InitDomainRequest,
    ) -> Result<pb::InitDomainResponse, PluginError> {
        Ok(pb::InitDomainResponse {})
    }

    async fn init_deploy(
        &self,
        _request: pb::InitDeployRequest,
    ) -> Result<pb::InitDeployResponse, PluginError> {
        Err(PluginError::Domain("not supported".into()))
    }

    async fn prepare_deploy(
        &self,
        _request: pb::PrepareDeployRequest,
    ) -> Result<pb::PrepareDeployResponse, PluginError> {
        Err(PluginError::Domain("not supported".into()))
    }

    async fn init_transaction(
        &self,
        _request: pb::InitTransactionRequest,
    ) -> Result<pb::InitTransactionResponse, PluginError> {
        Err(PluginError::Domain("not supported".into()))
    }

    async fn assemble_transaction(
        &self,
        _request: pb::AssembleTransactionRequest,
    ) -> Result<pb::AssembleTransactionResponse, PluginError> {
        Err(PluginError::Domain("not supported".into()))
    }

    async fn endorse_transaction(
        &self,
        _request: pb::EndorseTransactionRequest,
    ) -> Result<pb::EndorseTransactionResponse, PluginError> {
        Err(PluginError::Domain("not supported".into()))
    }

    async fn prepare_transaction(
        &self,
        _request: pb::PrepareTransactionRequest,
    ) -> Result<pb::PrepareTransactionResponse, PluginError> {
        Err(PluginError::Domain("not supported".into()))
    }

    async fn handle_event_batch(
        &self,
        _request: pb::HandleEventBatchRequest,
    ) -> Result<pb::HandleEventBatchResponse, PluginError> {
        Ok(pb::HandleEventBatchResponse {
            spent_states: vec![],
            confirmed_states: vec![],
            new_states: vec![],
            transactions_complete: vec![],
        })
    }

    async fn get_verifier(
        &self,
        _request: pb::GetVerifierRequest,
    ) -> Result<pb::GetVerifierResponse, PluginError> {
        Err(PluginError::Domain("not supported".into()))
    }

    async fn sign(&self, _request: pb::SignRequest) -> Result<pb::SignResponse, PluginError> {
        Err(PluginError::Domain("not supported".into()))
    }
}

#[tokio::test]
async fn events_abi_change_yields_fresh_stream_with_replay() {
    let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
    let store = StateStore::from_arc(backend);
    let indexer = Arc::new(ManualBlockIndexer::new());

    let abi_v1 = r#"[{"type":"event","name":"TransferV1","inputs":[]}]"#;
    let abi_v2 = r#"[{"type":"event","name":"TransferV2","inputs":[]}]"#;

    let manager1 = DomainManager::new(
        1337,
        store.clone(),
        Arc::clone(&indexer) as Arc<dyn BlockIndexer>,
        RetryPolicy::fast(),
    );
    let domain1 = manager1.register_domain(
        "tokens",
        REGISTRY,
        json!({}),
        Arc::new(FixedAbiDomain {
            events_abi: abi_v1.into(),
        }),
    );
    domain1.wait_initialized().await.unwrap();
    let stream1 = domain1.stream_name().unwrap();
    assert!(stream1.starts_with("domain_tokens_"));
    manager1.stop().await;

    // Reconfigured with a different events ABI: fresh stream, same family
    let manager2 = DomainManager::new(
        1337,
        store,
        Arc::clone(&indexer) as Arc<dyn BlockIndexer>,
        RetryPolicy::fast(),
    );
    let domain2 = manager2.register_domain(
        "tokens",
        REGISTRY,
        json!({}),
        Arc::new(FixedAbiDomain {
            events_abi: abi_v2.into(),
        }),
    );
    domain2.wait_initialized().await.unwrap();
    let stream2 = domain2.stream_name().unwrap();

    assert!(stream2.starts_with("domain_tokens_"));
    assert_ne!(stream1, stream2, "ABI change must change the stream name");
    assert!(indexer.is_tombstoned(&stream1).await);
    assert!(indexer.replayed_from_start(&stream2).await);
}

// ═══════════════════════════════════════════════════════════════════════════════
// ONE-TIME-USE SIGNER
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn prepared_transactions_use_one_time_keys() {
    let harness = setup().await;
    let contract = harness.deploy_token("notary").await;
    harness.mint(contract, "notary", "alice", 50).await;

    let submissions = harness.ledger.submissions.lock();
    for (tx_id, prepared) in submissions.iter() {
        assert_eq!(prepared.signer, format!("oneuse/{tx_id}"));
    }
    assert_eq!(submissions.len(), 2, "deploy + mint");
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFER ACROSS PARTIES
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn transfer_moves_value_between_parties() {
    let harness = setup().await;
    let contract = harness.deploy_token("notary").await;
    harness.mint(contract, "notary", "alice", 1000).await;

    let tx = paladin_engine::types::PrivateTransaction::invoke(
        "noto",
        contract,
        "alice",
        "transfer",
        json!({"to": "bob", "amount": "400"}),
    );
    assert_eq!(harness.engine.execute(tx).await.unwrap(), TxOutcome::Complete);

    assert_eq!(
        harness.available_amounts(contract, "bob").await,
        vec![U256::from(400)]
    );
    assert_eq!(
        harness.available_amounts(contract, "alice").await,
        vec![U256::from(600)]
    );
}
