//! Shared test harness: an in-memory engine wired to the Noto domain and a
//! fake base ledger that turns submissions straight into confirmation
//! events.

use std::sync::Arc;

use alloy::primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use noto_domain::Noto;
use paladin_keys::{algorithms, InMemorySigningModule, KeyManager, KeyResolver};
use paladin_plugin::LedgerEvent;
use paladin_state::{MemoryBackend, Schema, SchemaDef, StateBackend, StateQuery, StateStore};

use paladin_engine::domains::{Domain, DomainManager};
use paladin_engine::error::Result;
use paladin_engine::indexer::ManualBlockIndexer;
use paladin_engine::ports::{BaseLedgerSubmitter, BlockIndexer, LoggingReceiptWriter};
use paladin_engine::retry::RetryPolicy;
use paladin_engine::sequencer::{StageEngine, TxOutcome};
use paladin_engine::types::{LedgerOperation, PreparedLedgerTransaction, PrivateTransaction};

/// Fixed registry address used by every test.
pub const REGISTRY: Address = Address::repeat_byte(0xEE);

// ═══════════════════════════════════════════════════════════════════════════════
// FAKE BASE LEDGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Captures submissions and immediately confirms them: a `transfer` invoke
/// becomes a `NotoTransfer` event at the target contract; a `deployNoto`
/// invoke becomes a registration event at the registry.
pub struct FakeBaseLedger {
    indexer: Arc<ManualBlockIndexer>,
    registry: Address,
    block: Mutex<u64>,
    /// Every submission, in order.
    pub submissions: Mutex<Vec<(Uuid, PreparedLedgerTransaction)>>,
    /// Instance addresses minted by deploys, in order.
    pub deployed: Mutex<Vec<Address>>,
}

impl FakeBaseLedger {
    pub fn new(indexer: Arc<ManualBlockIndexer>, registry: Address) -> Self {
        Self {
            indexer,
            registry,
            block: Mutex::new(0),
            submissions: Mutex::new(Vec::new()),
            deployed: Mutex::new(Vec::new()),
        }
    }

    fn next_block(&self) -> u64 {
        let mut block = self.block.lock();
        *block += 1;
        *block
    }
}

#[async_trait]
impl BaseLedgerSubmitter for FakeBaseLedger {
    async fn submit(&self, tx_id: Uuid, prepared: &PreparedLedgerTransaction) -> Result<B256> {
        self.submissions.lock().push((tx_id, prepared.clone()));
        let LedgerOperation::Invoke {
            to,
            function_abi_json,
            params_json,
        } = &prepared.operation
        else {
            // Noto never prepares raw deploys; nothing to confirm
            return Ok(keccak256(tx_id.as_bytes()));
        };

        let function: serde_json::Value = serde_json::from_str(function_abi_json).unwrap();
        let params: serde_json::Value = serde_json::from_str(params_json).unwrap();
        let hash = keccak256(tx_id.as_bytes());
        let block_number = self.next_block();

        let event = match function["name"].as_str().unwrap() {
            "transfer" => LedgerEvent {
                address: format!("{to:#x}"),
                block_number,
                log_index: 0,
                transaction_hash: format!("{hash:#x}"),
                event_name: "NotoTransfer".into(),
                data: json!({
                    "inputs": params["inputs"],
                    "outputs": params["outputs"],
                    "data": params["data"],
                }),
            },
            "deployNoto" => {
                // Instance address derived from the deploy transaction
                let instance = Address::from_slice(&keccak256(tx_id.as_bytes())[12..]);
                self.deployed.lock().push(instance);
                LedgerEvent {
                    address: format!("{:#x}", self.registry),
                    block_number,
                    log_index: 0,
                    transaction_hash: format!("{hash:#x}"),
                    event_name: "PaladinRegisterSmartContract".into(),
                    data: json!({
                        "txId": params["txId"],
                        "instance": format!("{instance:#x}"),
                        "config": params["config"],
                    }),
                }
            }
            other => panic!("unexpected base-ledger function {other}"),
        };

        self.indexer.deliver(vec![event]).await?;
        Ok(hash)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HARNESS
// ═══════════════════════════════════════════════════════════════════════════════

pub struct TestHarness {
    pub manager: DomainManager,
    pub engine: StageEngine,
    pub indexer: Arc<ManualBlockIndexer>,
    pub keys: Arc<KeyManager<InMemorySigningModule>>,
    pub domain: Arc<Domain>,
    pub ledger: Arc<FakeBaseLedger>,
    pub coin_schema: Schema,
}

pub async fn setup() -> TestHarness {
    let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
    let store = StateStore::from_arc(backend);
    let indexer = Arc::new(ManualBlockIndexer::new());
    let manager = DomainManager::new(
        1337,
        store,
        Arc::clone(&indexer) as Arc<dyn BlockIndexer>,
        RetryPolicy::fast(),
    );

    let noto = Arc::new(Noto::new(Arc::new(manager.clone())));
    let domain = manager.register_domain("noto", REGISTRY, json!({}), noto);
    domain.wait_initialized().await.unwrap();

    let keys = Arc::new(KeyManager::new(InMemorySigningModule::new(
        B256::repeat_byte(0x5e),
    )));
    let ledger = Arc::new(FakeBaseLedger::new(Arc::clone(&indexer), REGISTRY));
    let engine = StageEngine::new(
        manager.clone(),
        keys.clone(),
        ledger.clone(),
        Arc::new(LoggingReceiptWriter),
        RetryPolicy::fast(),
        CancellationToken::new(),
    );

    let coin_schema = Schema::parse(
        "noto",
        SchemaDef::from_json(noto_domain::config::NOTO_COIN_SCHEMA_JSON).unwrap(),
    )
    .unwrap();

    TestHarness {
        manager,
        engine,
        indexer,
        keys,
        domain,
        ledger,
        coin_schema,
    }
}

impl TestHarness {
    /// Deploy a Noto token and return its instance address.
    pub async fn deploy_token(&self, notary: &str) -> Address {
        let tx = PrivateTransaction::deploy("noto", notary, json!({ "notary": notary }));
        let outcome = self.engine.execute(tx).await.unwrap();
        assert_eq!(outcome, TxOutcome::Complete, "deploy should complete");
        *self.ledger.deployed.lock().last().expect("deploy recorded")
    }

    pub async fn mint(&self, contract: Address, from: &str, to: &str, amount: u64) -> TxOutcome {
        let tx = PrivateTransaction::invoke(
            "noto",
            contract,
            from,
            "mint",
            json!({"to": to, "amount": amount.to_string()}),
        );
        self.engine.execute(tx).await.unwrap()
    }

    pub async fn burn(&self, contract: Address, from: &str, amount: u64) -> TxOutcome {
        let tx = PrivateTransaction::invoke(
            "noto",
            contract,
            from,
            "burn",
            json!({"amount": amount.to_string()}),
        );
        self.engine.execute(tx).await.unwrap()
    }

    /// Resolve the Ethereum address of an identity lookup.
    pub async fn address_of(&self, lookup: &str) -> Address {
        let (_, verifier) = self
            .keys
            .resolve_key(lookup, algorithms::ECDSA_SECP256K1)
            .await
            .unwrap();
        verifier.parse().unwrap()
    }

    /// The available coin amounts of an owner, ascending by creation.
    pub async fn available_amounts(&self, contract: Address, owner: &str) -> Vec<U256> {
        let owner = self.address_of(owner).await;
        let query = StateQuery::from_json(&format!(
            r#"{{"eq":[{{"field":"owner","value":"{owner:#x}"}}]}}"#
        ))
        .unwrap();
        let ctx = self.manager.store().begin("noto", contract).await;
        ctx.find_available_states(self.coin_schema.id, &query, None)
            .await
            .unwrap()
            .iter()
            .map(|s| {
                U256::from_str_radix(s.data["amount"].as_str().unwrap(), 10).unwrap()
            })
            .collect()
    }
}
