//! Process wiring for the engine binary.
//!
//! Builds the state store (postgres or embedded memory), the block indexer,
//! the domain manager, the plugin controller (when out-of-process domains
//! are configured) and the stage engine, and tears them down in order on
//! shutdown.

use std::sync::Arc;

use alloy::primitives::{keccak256, Address, B256};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use paladin_keys::{InMemorySigningModule, KeyManager};
use paladin_plugin::{pb, DomainPlugin, PluginController, PluginError};
use paladin_state::store::postgres::PostgresBackend;
use paladin_state::{MemoryBackend, StateBackend, StateStore};

use crate::config::Settings;
use crate::domains::{DomainManager, SharedStateStore};
use crate::error::{EngineError, Result};
use crate::indexer::ManualBlockIndexer;
use crate::ports::{BaseLedgerSubmitter, LoggingReceiptWriter};
use crate::sequencer::StageEngine;
use crate::types::PreparedLedgerTransaction;

// ═══════════════════════════════════════════════════════════════════════════════
// SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// The assembled engine process.
pub struct EngineService {
    manager: DomainManager,
    engine: StageEngine,
    controller: Option<PluginController>,
    indexer: Arc<ManualBlockIndexer>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for EngineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineService").finish_non_exhaustive()
    }
}

impl EngineService {
    /// Build and start the engine per the settings.
    ///
    /// `loader_id` gates the plugin loader stream; it comes from the CLI or
    /// environment of the process that supervises plugin loading.
    pub async fn start(settings: &Settings, loader_id: Uuid) -> Result<Self> {
        let store = build_store(settings).await?;
        let indexer = Arc::new(ManualBlockIndexer::new());
        let cancel = CancellationToken::new();

        let manager = DomainManager::new(
            settings.chain.chain_id,
            store,
            Arc::clone(&indexer) as Arc<dyn crate::ports::BlockIndexer>,
            settings.retry_policy(),
        );

        // Out-of-process domains attach through the plugin controller; the
        // lazy bridge lets the init retry loop spin until they connect.
        let controller = if settings.domains.is_empty() {
            None
        } else {
            let controller = PluginController::new(
                loader_id,
                settings.plugin_controller_config(),
                Arc::new(manager.clone()),
            )?;
            controller.start().await?;
            for (name, domain_settings) in &settings.domains {
                let registry: Address = domain_settings
                    .registry_address
                    .parse()
                    .map_err(|_| EngineError::AddressInvalid(domain_settings.registry_address.clone()))?;
                manager.register_domain(
                    name,
                    registry,
                    domain_settings.config.clone(),
                    Arc::new(ControllerDomain {
                        controller: controller.clone(),
                        name: name.clone(),
                    }),
                );
            }
            Some(controller)
        };

        let keys = Arc::new(KeyManager::new(InMemorySigningModule::new(signing_seed(
            settings,
        ))));
        let engine = StageEngine::new(
            manager.clone(),
            keys,
            Arc::new(LogOnlySubmitter),
            Arc::new(LoggingReceiptWriter),
            settings.retry_policy(),
            cancel.child_token(),
        );

        info!(node = %settings.node.name, chain_id = settings.chain.chain_id,
              domains = settings.domains.len(), "engine service started");
        Ok(Self {
            manager,
            engine,
            controller,
            indexer,
            cancel,
        })
    }

    /// The domain manager.
    #[must_use]
    pub fn manager(&self) -> &DomainManager {
        &self.manager
    }

    /// The stage engine.
    #[must_use]
    pub fn engine(&self) -> &StageEngine {
        &self.engine
    }

    /// The embedded block indexer.
    #[must_use]
    pub fn indexer(&self) -> &Arc<ManualBlockIndexer> {
        &self.indexer
    }

    /// The plugin controller, when out-of-process domains are configured.
    #[must_use]
    pub fn plugin_controller(&self) -> Option<&PluginController> {
        self.controller.as_ref()
    }

    /// Stop everything: stage engine scope, domains, then the controller.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.manager.stop().await;
        if let Some(controller) = &self.controller {
            controller.stop().await;
        }
        info!("engine service stopped");
    }
}

fn signing_seed(settings: &Settings) -> B256 {
    settings
        .signing
        .seed
        .as_deref()
        .and_then(|s| s.trim_start_matches("0x").parse::<B256>().ok())
        .unwrap_or_else(|| {
            let entropy = [Uuid::new_v4().into_bytes(), Uuid::new_v4().into_bytes()].concat();
            info!("no signing seed configured, generated an ephemeral one");
            keccak256(entropy)
        })
}

async fn build_store(settings: &Settings) -> Result<SharedStateStore> {
    if settings.database.url.starts_with("postgres") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(settings.database.max_connections)
            .connect(&settings.database.url)
            .await
            .map_err(paladin_state::StateError::Database)?;
        let backend = PostgresBackend::new(pool);
        backend.run_migrations().await?;
        let backend: Arc<dyn StateBackend> = Arc::new(backend);
        Ok(StateStore::from_arc(backend))
    } else {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        Ok(StateStore::from_arc(backend))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LAZY PLUGIN BRIDGE
// ═══════════════════════════════════════════════════════════════════════════════

/// `DomainPlugin` that resolves the connected plugin at call time.
///
/// Before the plugin connects every call fails with a transport error,
/// which the domain init loop retries indefinitely - exactly the behavior
/// wanted while the loader is still spawning processes.
struct ControllerDomain {
    controller: PluginController,
    name: String,
}

impl ControllerDomain {
    fn connected(&self) -> std::result::Result<Arc<paladin_plugin::remote::RemoteDomain>, PluginError> {
        self.controller.domain(&self.name).ok_or_else(|| {
            PluginError::Transport(format!("plugin {} not connected", self.name))
        })
    }
}

/// Expand the whole forwarding impl in one item-level pass.
macro_rules! controller_domain_forward {
    ($($method:ident, $req:ty, $res:ty;)+) => {
        #[async_trait]
        impl DomainPlugin for ControllerDomain {
            $(
                async fn $method(
                    &self,
                    request: $req,
                ) -> std::result::Result<$res, PluginError> {
                    self.connected()?.$method(request).await
                }
            )+
        }
    };
}

controller_domain_forward! {
    configure_domain, pb::ConfigureDomainRequest, pb::ConfigureDomainResponse;
    init_domain, pb::InitDomainRequest, pb::InitDomainResponse;
    init_deploy, pb::InitDeployRequest, pb::InitDeployResponse;
    prepare_deploy, pb::PrepareDeployRequest, pb::PrepareDeployResponse;
    init_transaction, pb::InitTransactionRequest, pb::InitTransactionResponse;
    assemble_transaction, pb::AssembleTransactionRequest, pb::AssembleTransactionResponse;
    endorse_transaction, pb::EndorseTransactionRequest, pb::EndorseTransactionResponse;
    prepare_transaction, pb::PrepareTransactionRequest, pb::PrepareTransactionResponse;
    handle_event_batch, pb::HandleEventBatchRequest, pb::HandleEventBatchResponse;
    get_verifier, pb::GetVerifierRequest, pb::GetVerifierResponse;
    sign, pb::SignRequest, pb::SignResponse;
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEFAULT SUBMITTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Submitter used when no base-ledger submission layer is wired: logs the
/// artifact and reports a synthetic hash.
#[derive(Debug, Default, Clone)]
pub struct LogOnlySubmitter;

#[async_trait]
impl BaseLedgerSubmitter for LogOnlySubmitter {
    async fn submit(&self, tx_id: Uuid, prepared: &PreparedLedgerTransaction) -> Result<B256> {
        info!(tx = %tx_id, signer = %prepared.signer, operation = ?prepared.operation,
              "base-ledger submission (no submitter wired)");
        Ok(keccak256(tx_id.as_bytes()))
    }
}
