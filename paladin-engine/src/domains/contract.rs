//! Private contract records and the runtime cache.
//!
//! A private contract is an instantiation of a domain at a shared-ledger
//! address, discovered by the registration indexer watching the domain's
//! registry. Parsed records are cached; misses always fall through to the
//! state store (no negative caching), so an event from an unrecognized
//! contract costs a lookup every time.

use std::sync::Arc;

use alloy::primitives::Address;
use chrono::Utc;
use moka::future::Cache;
use tracing::debug;

use paladin_state::PrivateContractRecord;

use crate::domains::SharedStateStore;
use crate::error::Result;

/// Cached entries; registrations are rare, reads are hot.
const CONTRACT_CACHE_CAPACITY: u64 = 10_000;

/// A deployed private contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateContract {
    /// Shared-ledger address of the instance.
    pub address: Address,
    /// The domain the instance belongs to.
    pub domain: String,
    /// Opaque configuration captured at deployment.
    pub config_bytes: Vec<u8>,
}

impl PrivateContract {
    /// The config bytes in their on-wire hex form.
    #[must_use]
    pub fn config_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.config_bytes))
    }
}

impl From<PrivateContractRecord> for PrivateContract {
    fn from(record: PrivateContractRecord) -> Self {
        Self {
            address: record.address,
            domain: record.domain,
            config_bytes: record.config_bytes,
        }
    }
}

/// Shared contract lookup: moka cache over the persistent records.
#[derive(Clone)]
pub struct ContractRuntime {
    store: SharedStateStore,
    cache: Cache<Address, Arc<PrivateContract>>,
}

impl std::fmt::Debug for ContractRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractRuntime")
            .field("cached", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl ContractRuntime {
    /// Create a runtime over the persistent store.
    #[must_use]
    pub fn new(store: SharedStateStore) -> Self {
        Self {
            store,
            cache: Cache::new(CONTRACT_CACHE_CAPACITY),
        }
    }

    /// Look up a contract by address.
    ///
    /// Hits are cached; unknown addresses go to the store every time.
    pub async fn get(&self, address: Address) -> Result<Option<Arc<PrivateContract>>> {
        if let Some(contract) = self.cache.get(&address).await {
            return Ok(Some(contract));
        }
        let Some(record) = self.store.get_private_contract(address).await? else {
            return Ok(None);
        };
        let contract = Arc::new(PrivateContract::from(record));
        self.cache.insert(address, Arc::clone(&contract)).await;
        Ok(Some(contract))
    }

    /// Record a newly registered contract.
    pub async fn register(
        &self,
        address: Address,
        domain: &str,
        config_bytes: Vec<u8>,
    ) -> Result<Arc<PrivateContract>> {
        let record = PrivateContractRecord {
            address,
            domain: domain.to_string(),
            config_bytes,
            created_at: Utc::now(),
        };
        self.store.upsert_private_contract(&record).await?;
        let contract = Arc::new(PrivateContract::from(record));
        self.cache.insert(address, Arc::clone(&contract)).await;
        debug!(%address, domain, "private contract registered");
        Ok(contract)
    }
}
