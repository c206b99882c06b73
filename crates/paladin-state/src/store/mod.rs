//! The storage port behind the state store.
//!
//! [`StateBackend`] is the adapter boundary: domain contexts buffer
//! [`WriteOp`]s and hand the backend one [`WriteBatch`] to apply atomically.
//! Queries are pushed down so each adapter can use its native filtering
//! (in-memory evaluation, or compiled SQL for postgres).

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::query::StateQuery;
use crate::schema::Schema;
use crate::state::{StateLock, StateRecord};

pub mod memory;
pub mod postgres;

// ═══════════════════════════════════════════════════════════════════════════════
// WRITE BATCH
// ═══════════════════════════════════════════════════════════════════════════════

/// One buffered mutation.
///
/// Ops apply in batch order; a domain context always buffers upserts before
/// spends before confirmations within one event batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a state (no-op if the ID already exists).
    InsertState(StateRecord),
    /// Attach or refresh a per-transaction lock.
    Lock {
        /// The state to lock.
        state_id: B256,
        /// The lock to record.
        lock: StateLock,
    },
    /// Record the state as spent by `tx_id`.
    MarkSpent {
        /// The state being spent.
        state_id: B256,
        /// The spending transaction.
        tx_id: Uuid,
    },
    /// Record the state as confirmed by `tx_id`.
    MarkConfirmed {
        /// The state being confirmed.
        state_id: B256,
        /// The confirming transaction.
        tx_id: Uuid,
    },
    /// Attach a nullifier to a state.
    PutNullifier {
        /// The state the nullifier hides.
        state_id: B256,
        /// The nullifier value.
        nullifier: B256,
    },
}

/// All mutations of one committed domain context.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    /// Owning domain.
    pub domain: String,
    /// The contract all ops belong to.
    pub contract: Address,
    /// Ordered mutations.
    pub ops: Vec<WriteOp>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PRIVATE CONTRACTS
// ═══════════════════════════════════════════════════════════════════════════════

/// A deployed private contract, discovered at a domain's registry address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateContractRecord {
    /// Shared-ledger address of the instance.
    pub address: Address,
    /// The domain the instance belongs to.
    pub domain: String,
    /// Opaque configuration captured at deployment.
    pub config_bytes: Vec<u8>,
    /// When the registration was indexed.
    pub created_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BACKEND PORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage adapter for schemas, states and private contracts.
#[async_trait]
pub trait StateBackend: Send + Sync + 'static {
    /// Idempotently record schemas, unique per `(domain, signature)`.
    async fn upsert_schemas(&self, schemas: &[Schema]) -> Result<()>;

    /// Fetch a schema by domain and ID.
    async fn get_schema(&self, domain: &str, id: B256) -> Result<Option<Schema>>;

    /// Fetch specific states (any status) by ID.
    async fn get_states(
        &self,
        domain: &str,
        contract: Address,
        ids: &[B256],
    ) -> Result<Vec<StateRecord>>;

    /// Find states of one schema that are available to `lock_holder` and
    /// match `query`.
    ///
    /// With `use_nullifiers` set, only states carrying a nullifier are
    /// considered. Results are in the query's deterministic order and
    /// truncated to its limit.
    async fn find_available_states(
        &self,
        domain: &str,
        contract: Address,
        schema_id: B256,
        query: &StateQuery,
        lock_holder: Option<Uuid>,
        use_nullifiers: bool,
    ) -> Result<Vec<StateRecord>>;

    /// Apply one batch of mutations atomically.
    async fn apply(&self, batch: WriteBatch) -> Result<()>;

    /// Record a private contract (no-op when the address is known).
    async fn upsert_private_contract(&self, contract: &PrivateContractRecord) -> Result<()>;

    /// Look up a private contract by address.
    async fn get_private_contract(
        &self,
        address: Address,
    ) -> Result<Option<PrivateContractRecord>>;
}
