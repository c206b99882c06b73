//! In-memory backend.
//!
//! Keeps every table in process memory behind a single `RwLock`. This is the
//! backend used by unit and integration tests, and by embedded deployments
//! that do not need durability. The behavioral contract is identical to the
//! postgres adapter; the whole state-store test suite runs against this
//! implementation.

use std::collections::HashMap;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Result, StateError};
use crate::query::StateQuery;
use crate::schema::Schema;
use crate::state::StateRecord;

use super::{PrivateContractRecord, StateBackend, WriteBatch, WriteOp};

/// In-memory state tables.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<Tables>,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    /// `(domain, signature) → schema ID`, the uniqueness constraint.
    schemas_by_signature: HashMap<(String, String), B256>,
    /// `(domain, schema ID) → schema`.
    schemas: HashMap<(String, B256), Schema>,
    /// `(domain, contract, state ID) → state`.
    states: HashMap<(String, Address, B256), StateRecord>,
    /// Registered private contracts by address.
    contracts: HashMap<Address, PrivateContractRecord>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of states stored for a contract, any status. Test helper.
    #[must_use]
    pub fn state_count(&self, domain: &str, contract: Address) -> usize {
        self.inner
            .read()
            .states
            .keys()
            .filter(|(d, c, _)| d == domain && *c == contract)
            .count()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn upsert_schemas(&self, schemas: &[Schema]) -> Result<()> {
        let mut tables = self.inner.write();
        for schema in schemas {
            let sig_key = (schema.domain.clone(), schema.signature.clone());
            if let Some(existing) = tables.schemas_by_signature.get(&sig_key) {
                // Same signature always derives the same ID; nothing to do.
                debug_assert_eq!(existing, &schema.id);
                continue;
            }
            tables.schemas_by_signature.insert(sig_key, schema.id);
            tables
                .schemas
                .insert((schema.domain.clone(), schema.id), schema.clone());
        }
        Ok(())
    }

    async fn get_schema(&self, domain: &str, id: B256) -> Result<Option<Schema>> {
        Ok(self
            .inner
            .read()
            .schemas
            .get(&(domain.to_string(), id))
            .cloned())
    }

    async fn get_states(
        &self,
        domain: &str,
        contract: Address,
        ids: &[B256],
    ) -> Result<Vec<StateRecord>> {
        let tables = self.inner.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                tables
                    .states
                    .get(&(domain.to_string(), contract, *id))
                    .cloned()
            })
            .collect())
    }

    async fn find_available_states(
        &self,
        domain: &str,
        contract: Address,
        schema_id: B256,
        query: &StateQuery,
        lock_holder: Option<Uuid>,
        use_nullifiers: bool,
    ) -> Result<Vec<StateRecord>> {
        let tables = self.inner.read();
        let mut matches: Vec<StateRecord> = tables
            .states
            .iter()
            .filter(|((d, c, _), _)| d == domain && *c == contract)
            .map(|(_, s)| s)
            .filter(|s| s.schema_id == schema_id)
            .filter(|s| !use_nullifiers || s.nullifier.is_some())
            .filter(|s| s.available_to(lock_holder))
            .filter(|s| query.matches(&s.data))
            .cloned()
            .collect();
        matches.sort_by(|a, b| query.order(a, b));
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.inner.write();
        // Stage on a copy so a failing op leaves nothing applied.
        let mut staged = tables.clone();
        for op in batch.ops {
            match op {
                WriteOp::InsertState(state) => {
                    let key = (batch.domain.clone(), batch.contract, state.id);
                    staged.states.entry(key).or_insert(state);
                }
                WriteOp::Lock { state_id, lock } => {
                    let state = existing(&mut staged, &batch.domain, batch.contract, state_id)?;
                    state.lock = Some(lock);
                }
                WriteOp::MarkSpent { state_id, .. } => {
                    let state = existing(&mut staged, &batch.domain, batch.contract, state_id)?;
                    state.spent = true;
                    state.lock = None;
                }
                WriteOp::MarkConfirmed { state_id, .. } => {
                    let state = existing(&mut staged, &batch.domain, batch.contract, state_id)?;
                    state.confirmed = true;
                    if state.lock.is_some_and(|l| l.creating && !l.spending) {
                        state.lock = None;
                    }
                }
                WriteOp::PutNullifier { state_id, nullifier } => {
                    let state = existing(&mut staged, &batch.domain, batch.contract, state_id)?;
                    match state.nullifier {
                        Some(existing_value) if existing_value != nullifier => {
                            return Err(StateError::NullifierConflict {
                                state: format!("0x{}", hex::encode(state_id)),
                            });
                        }
                        _ => state.nullifier = Some(nullifier),
                    }
                }
            }
        }
        *tables = staged;
        Ok(())
    }

    async fn upsert_private_contract(&self, contract: &PrivateContractRecord) -> Result<()> {
        self.inner
            .write()
            .contracts
            .entry(contract.address)
            .or_insert_with(|| contract.clone());
        Ok(())
    }

    async fn get_private_contract(
        &self,
        address: Address,
    ) -> Result<Option<PrivateContractRecord>> {
        Ok(self.inner.read().contracts.get(&address).cloned())
    }
}

fn existing<'a>(
    tables: &'a mut Tables,
    domain: &str,
    contract: Address,
    state_id: B256,
) -> Result<&'a mut StateRecord> {
    tables
        .states
        .get_mut(&(domain.to_string(), contract, state_id))
        .ok_or_else(|| StateError::InvalidTransition {
            state: format!("0x{}", hex::encode(state_id)),
            detail: "state does not exist".into(),
        })
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
