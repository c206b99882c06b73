//! The domain manager.
//!
//! Owns the set of active domains, the private-contract runtime cache and
//! the in-flight transaction waiters. Domains derive cancellation scopes
//! from the manager's background scope; each runs its init loop and stream
//! handling in its own tasks.
//!
//! The manager is also the [`DomainCallbacks`] implementation plugins call
//! back into: state queries open fresh domain contexts, and encoding /
//! recovery are pure.

use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use paladin_plugin::{pb, DomainCallbacks, DomainPlugin, PluginError};
use paladin_state::{StateBackend, StateStore};

use crate::error::{EngineError, Result};
use crate::ports::BlockIndexer;
use crate::retry::RetryPolicy;
use crate::sequencer::waiter::TransactionWaiters;

pub mod contract;
pub mod domain;
pub mod encoding;

pub use contract::{ContractRuntime, PrivateContract};
pub use domain::{AssembleOutcome, Domain, EndorseOutcome, REGISTRY_ABI_JSON};

/// The state store as shared by every engine component.
pub type SharedStateStore = StateStore<dyn StateBackend>;

// ═══════════════════════════════════════════════════════════════════════════════
// DOMAIN MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

struct ManagerInner {
    chain_id: u64,
    store: SharedStateStore,
    block_indexer: Arc<dyn BlockIndexer>,
    contracts: ContractRuntime,
    waiters: TransactionWaiters,
    retry: RetryPolicy,
    domains: DashMap<String, Arc<Domain>>,
    cancel: CancellationToken,
}

/// Registry and mediator for all active domains.
#[derive(Clone)]
pub struct DomainManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for DomainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainManager")
            .field("chain_id", &self.inner.chain_id)
            .field("domains", &self.inner.domains.len())
            .finish_non_exhaustive()
    }
}

impl DomainManager {
    /// Create a manager over the shared store and block indexer.
    #[must_use]
    pub fn new(
        chain_id: u64,
        store: SharedStateStore,
        block_indexer: Arc<dyn BlockIndexer>,
        retry: RetryPolicy,
    ) -> Self {
        let contracts = ContractRuntime::new(store.clone());
        Self {
            inner: Arc::new(ManagerInner {
                chain_id,
                store,
                block_indexer,
                contracts,
                waiters: TransactionWaiters::new(),
                retry,
                domains: DashMap::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Register a domain and start its init loop.
    pub fn register_domain(
        &self,
        name: &str,
        registry_address: Address,
        config_json: serde_json::Value,
        plugin: Arc<dyn DomainPlugin>,
    ) -> Arc<Domain> {
        let domain = Arc::new(Domain::new(
            name.to_string(),
            registry_address,
            config_json,
            self.inner.chain_id,
            plugin,
            self.inner.store.clone(),
            Arc::clone(&self.inner.block_indexer),
            self.inner.contracts.clone(),
            self.inner.waiters.clone(),
            self.inner.retry.clone(),
            self.inner.cancel.child_token(),
        ));
        domain.spawn_init();
        self.inner.domains.insert(name.to_string(), Arc::clone(&domain));
        info!(domain = name, %registry_address, "domain registered");
        domain
    }

    /// Look up a domain by name.
    pub fn domain(&self, name: &str) -> Result<Arc<Domain>> {
        self.inner
            .domains
            .get(name)
            .map(|d| Arc::clone(&d))
            .ok_or_else(|| EngineError::DomainNotInitialized(name.to_string()))
    }

    /// Resolve the domain and parsed contract for an address.
    pub async fn domain_of_contract(
        &self,
        address: Address,
    ) -> Result<(Arc<Domain>, Arc<PrivateContract>)> {
        let contract = self
            .inner
            .contracts
            .get(address)
            .await?
            .ok_or_else(|| EngineError::ContractNotFound(format!("{address:#x}")))?;
        let domain = self.domain(&contract.domain)?;
        Ok((domain, contract))
    }

    /// The in-flight transaction waiters.
    #[must_use]
    pub fn waiters(&self) -> &TransactionWaiters {
        &self.inner.waiters
    }

    /// The shared contract runtime.
    #[must_use]
    pub fn contracts(&self) -> &ContractRuntime {
        &self.inner.contracts
    }

    /// The shared state store.
    #[must_use]
    pub fn store(&self) -> &SharedStateStore {
        &self.inner.store
    }

    /// The configured chain ID.
    #[must_use]
    pub const fn chain_id(&self) -> u64 {
        self.inner.chain_id
    }

    /// Cancel the background scope and close every domain.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let domains: Vec<Arc<Domain>> = self
            .inner
            .domains
            .iter()
            .map(|d| Arc::clone(&d))
            .collect();
        for domain in domains {
            domain.close().await;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOMAIN CALLBACKS
// ═══════════════════════════════════════════════════════════════════════════════

type CallbackResult<T> = std::result::Result<T, PluginError>;

fn callback_err(error: EngineError) -> PluginError {
    match error {
        EngineError::Plugin(inner) => inner,
        other => PluginError::Domain(other.to_string()),
    }
}

#[async_trait]
impl DomainCallbacks for DomainManager {
    async fn find_available_states(
        &self,
        request: pb::FindAvailableStatesRequest,
    ) -> CallbackResult<pb::FindAvailableStatesResponse> {
        let address: Address = request
            .contract_address
            .parse()
            .map_err(|_| PluginError::Domain(format!(
                "invalid contract address {:?}",
                request.contract_address
            )))?;
        let (domain, _) = self
            .domain_of_contract(address)
            .await
            .map_err(callback_err)?;
        domain
            .find_available_states(request)
            .await
            .map_err(callback_err)
    }

    async fn encode_data(
        &self,
        request: pb::EncodeDataRequest,
    ) -> CallbackResult<pb::EncodeDataResponse> {
        encoding::encode_data(self.inner.chain_id, &request).map_err(callback_err)
    }

    async fn recover_signer(
        &self,
        request: pb::RecoverSignerRequest,
    ) -> CallbackResult<pb::RecoverSignerResponse> {
        encoding::recover_signer(&request).map_err(callback_err)
    }
}
