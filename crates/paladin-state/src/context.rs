//! The state store facade and its transactional domain contexts.
//!
//! A [`DomainContext`] is the scoped boundary through which all state
//! mutations of one `(domain, contract)` pair flow. Contexts for the same
//! pair are serialized by an async mutex; contexts for distinct pairs
//! proceed in parallel.
//!
//! Writes are buffered inside the context and applied to the backend as one
//! atomic batch on [`DomainContext::commit`]. Reads within the context
//! observe its own buffered writes. Dropping a context without committing
//! discards everything it buffered; an operation that fails poisons the
//! context so it can no longer commit.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, B256};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Result, StateError};
use crate::query::StateQuery;
use crate::schema::{Schema, SchemaDef};
use crate::state::{state_id, NullifierUpsert, StateLock, StateRecord, StateUpsert};
use crate::store::{StateBackend, WriteBatch, WriteOp};

// ═══════════════════════════════════════════════════════════════════════════════
// STATE STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Entry point to the per-contract state store.
///
/// Cheap to clone; the backend and the per-contract lock table are shared.
#[derive(Debug)]
pub struct StateStore<B: ?Sized> {
    backend: Arc<B>,
    context_locks: Arc<DashMap<(String, Address), Arc<Mutex<()>>>>,
}

impl<B: ?Sized> Clone for StateStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            context_locks: Arc::clone(&self.context_locks),
        }
    }
}

impl<B: StateBackend> StateStore<B> {
    /// Create a store over a backend.
    pub fn new(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }
}

impl<B: StateBackend + ?Sized> StateStore<B> {
    /// Create a store over a shared backend.
    pub fn from_arc(backend: Arc<B>) -> Self {
        Self {
            backend,
            context_locks: Arc::new(DashMap::new()),
        }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Idempotently record schemas for a domain.
    ///
    /// Definitions with the same canonical signature collapse to the same
    /// schema ID; the returned vector preserves input order.
    #[instrument(skip_all, fields(domain, count = defs.len()))]
    pub async fn ensure_abi_schemas(&self, domain: &str, defs: &[SchemaDef]) -> Result<Vec<Schema>> {
        let mut schemas = Vec::with_capacity(defs.len());
        for def in defs {
            schemas.push(Schema::parse(domain, def.clone())?);
        }
        self.backend.upsert_schemas(&schemas).await?;
        debug!(domain, count = schemas.len(), "schemas recorded");
        Ok(schemas)
    }

    /// Open a domain context for `(domain, contract)`.
    ///
    /// Suspends until any concurrent context for the same pair has finished.
    pub async fn begin(&self, domain: &str, contract: Address) -> DomainContext<B> {
        let lock = self
            .context_locks
            .entry((domain.to_string(), contract))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        DomainContext {
            backend: Arc::clone(&self.backend),
            domain: domain.to_string(),
            contract,
            ops: Vec::new(),
            overlay: HashMap::new(),
            poisoned: false,
            _guard: guard,
        }
    }

    /// Look up a private contract record.
    pub async fn get_private_contract(
        &self,
        address: Address,
    ) -> Result<Option<crate::store::PrivateContractRecord>> {
        self.backend.get_private_contract(address).await
    }

    /// Record a private contract discovered at a registry.
    pub async fn upsert_private_contract(
        &self,
        record: &crate::store::PrivateContractRecord,
    ) -> Result<()> {
        self.backend.upsert_private_contract(record).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOMAIN CONTEXT
// ═══════════════════════════════════════════════════════════════════════════════

/// A serialized, buffered mutation scope over one `(domain, contract)` pair.
#[derive(Debug)]
pub struct DomainContext<B: ?Sized> {
    backend: Arc<B>,
    domain: String,
    contract: Address,
    /// Buffered mutations in application order.
    ops: Vec<WriteOp>,
    /// In-context view of every state touched or created here.
    overlay: HashMap<B256, StateRecord>,
    poisoned: bool,
    _guard: OwnedMutexGuard<()>,
}

impl<B: StateBackend + ?Sized> DomainContext<B> {
    /// The domain this context is scoped to.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The contract this context is scoped to.
    #[must_use]
    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Find states of `schema_id` available to `lock_holder`, by ID.
    pub async fn find_available_states(
        &self,
        schema_id: B256,
        query: &StateQuery,
        lock_holder: Option<Uuid>,
    ) -> Result<Vec<StateRecord>> {
        self.find_available(schema_id, query, lock_holder, false).await
    }

    /// Find states of `schema_id` available to `lock_holder`, by nullifier.
    ///
    /// Only states that have a nullifier recorded participate.
    pub async fn find_available_nullifiers(
        &self,
        schema_id: B256,
        query: &StateQuery,
        lock_holder: Option<Uuid>,
    ) -> Result<Vec<StateRecord>> {
        self.find_available(schema_id, query, lock_holder, true).await
    }

    async fn find_available(
        &self,
        schema_id: B256,
        query: &StateQuery,
        lock_holder: Option<Uuid>,
        use_nullifiers: bool,
    ) -> Result<Vec<StateRecord>> {
        let schema = self
            .backend
            .get_schema(&self.domain, schema_id)
            .await?
            .ok_or_else(|| StateError::SchemaNotFound(format!("0x{}", hex::encode(schema_id))))?;
        query.validate_for(&schema)?;

        let stored = self
            .backend
            .find_available_states(
                &self.domain,
                self.contract,
                schema_id,
                // Push filters down without the limit: overlay merging below can
                // both remove stored results and add in-context ones.
                &StateQuery {
                    limit: None,
                    ..query.clone()
                },
                lock_holder,
                use_nullifiers,
            )
            .await?;

        // Merge with the context's own view: overlay versions win, and states
        // only this context knows about are added.
        let mut merged: HashMap<B256, &StateRecord> =
            stored.iter().map(|s| (s.id, s)).collect();
        for (id, state) in &self.overlay {
            merged.insert(*id, state);
        }
        let mut results: Vec<StateRecord> = merged
            .into_values()
            .filter(|s| s.schema_id == schema_id)
            .filter(|s| !use_nullifiers || s.nullifier.is_some())
            .filter(|s| s.available_to(lock_holder))
            .filter(|s| query.matches(&s.data))
            .cloned()
            .collect();
        results.sort_by(|a, b| query.order(a, b));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Fetch specific states by ID, any status, honoring buffered writes.
    pub async fn get_states(&self, ids: &[B256]) -> Result<Vec<StateRecord>> {
        let missing: Vec<B256> = ids
            .iter()
            .filter(|id| !self.overlay.contains_key(*id))
            .copied()
            .collect();
        let stored = self
            .backend
            .get_states(&self.domain, self.contract, &missing)
            .await?;
        let stored_by_id: HashMap<B256, StateRecord> =
            stored.into_iter().map(|s| (s.id, s)).collect();
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.overlay
                    .get(id)
                    .cloned()
                    .or_else(|| stored_by_id.get(id).cloned())
            })
            .collect())
    }

    /// Write new (or re-assert existing) states.
    ///
    /// IDs are derived from `(schema, data)` when not supplied. With a
    /// transaction and `creating` set, the state is locked to that
    /// transaction until confirmation.
    #[instrument(skip_all, fields(domain = %self.domain, count = upserts.len()))]
    pub async fn upsert_states(
        &mut self,
        tx_id: Option<Uuid>,
        upserts: Vec<StateUpsert>,
    ) -> Result<Vec<StateRecord>> {
        self.check_poisoned()?;
        let mut written = Vec::with_capacity(upserts.len());
        for upsert in upserts {
            let result = self.upsert_one(tx_id, upsert).await;
            match result {
                Ok(state) => written.push(state),
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    async fn upsert_one(&mut self, tx_id: Option<Uuid>, upsert: StateUpsert) -> Result<StateRecord> {
        // The schema must be recorded before states can reference it.
        self.backend
            .get_schema(&self.domain, upsert.schema_id)
            .await?
            .ok_or_else(|| {
                StateError::SchemaNotFound(format!("0x{}", hex::encode(upsert.schema_id)))
            })?;

        let id = upsert
            .id
            .unwrap_or_else(|| state_id(upsert.schema_id, &upsert.data));
        let lock = tx_id.filter(|_| upsert.creating).map(|tx| StateLock {
            tx_id: tx,
            creating: true,
            spending: false,
        });

        let state = match self.resolve(id).await? {
            // Re-asserting existing content: keep the stored record, refresh
            // the lock if the writer asked for one.
            Some(mut existing) => {
                if let Some(lock) = lock {
                    existing.lock = Some(lock);
                    self.ops.push(WriteOp::Lock { state_id: id, lock });
                }
                existing
            }
            None => {
                let state = StateRecord {
                    id,
                    schema_id: upsert.schema_id,
                    domain: self.domain.clone(),
                    contract: self.contract,
                    data: upsert.data,
                    created_at: Utc::now(),
                    lock,
                    confirmed: false,
                    spent: false,
                    nullifier: None,
                };
                self.ops.push(WriteOp::InsertState(state.clone()));
                if let Some(lock) = lock {
                    self.ops.push(WriteOp::Lock { state_id: id, lock });
                }
                state
            }
        };
        self.overlay.insert(id, state.clone());
        Ok(state)
    }

    /// Lock states for spending by `tx_id`.
    ///
    /// Used at assembly time: the inputs of an assembled transaction become
    /// unavailable to every other transaction until the spend confirms (or
    /// the lock is replaced). Locking a state another transaction already
    /// holds, or one that does not exist, is an invalid transition.
    pub async fn lock_states_spending(&mut self, tx_id: Uuid, ids: &[B256]) -> Result<()> {
        self.check_poisoned()?;
        for &id in ids {
            let state = match self.resolve(id).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    self.poisoned = true;
                    return Err(StateError::InvalidTransition {
                        state: format!("0x{}", hex::encode(id)),
                        detail: "spending lock on unknown state".into(),
                    });
                }
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            };
            if !state.available_to(Some(tx_id)) {
                self.poisoned = true;
                return Err(StateError::InvalidTransition {
                    state: format!("0x{}", hex::encode(id)),
                    detail: "state not available to the locking transaction".into(),
                });
            }
            let lock = StateLock {
                tx_id,
                creating: state.lock.is_some_and(|l| l.creating && l.tx_id == tx_id),
                spending: true,
            };
            let mut updated = state;
            updated.lock = Some(lock);
            self.overlay.insert(id, updated);
            self.ops.push(WriteOp::Lock { state_id: id, lock });
        }
        Ok(())
    }

    /// Mark states as spent by `tx_id`.
    ///
    /// Spending an unknown state is an invalid transition and poisons the
    /// context. Spending an already-spent state is idempotent: the event log
    /// totally orders spends, so a replay changes nothing.
    pub async fn mark_states_spent(&mut self, tx_id: Uuid, ids: &[B256]) -> Result<()> {
        self.check_poisoned()?;
        for &id in ids {
            let state = match self.resolve(id).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    self.poisoned = true;
                    return Err(StateError::InvalidTransition {
                        state: format!("0x{}", hex::encode(id)),
                        detail: "spend of unknown state".into(),
                    });
                }
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            };
            if state.spent {
                continue;
            }
            let mut updated = state;
            updated.spent = true;
            updated.lock = None;
            self.overlay.insert(id, updated);
            self.ops.push(WriteOp::MarkSpent { state_id: id, tx_id });
        }
        Ok(())
    }

    /// Mark states as confirmed by `tx_id`.
    ///
    /// Confirmation of an unknown state is an invalid transition; confirming
    /// an already-confirmed state is idempotent.
    pub async fn mark_states_confirmed(&mut self, tx_id: Uuid, ids: &[B256]) -> Result<()> {
        self.check_poisoned()?;
        for &id in ids {
            let state = match self.resolve(id).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    self.poisoned = true;
                    return Err(StateError::InvalidTransition {
                        state: format!("0x{}", hex::encode(id)),
                        detail: "confirmation of unknown state".into(),
                    });
                }
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            };
            if state.confirmed && !state.spent {
                continue;
            }
            let mut updated = state;
            updated.confirmed = true;
            if updated.lock.is_some_and(|l| l.creating && !l.spending) {
                updated.lock = None;
            }
            self.overlay.insert(id, updated);
            self.ops.push(WriteOp::MarkConfirmed { state_id: id, tx_id });
        }
        Ok(())
    }

    /// Attach nullifiers to states. At most one nullifier per state; a
    /// different value for a state that already has one is a conflict.
    pub async fn upsert_nullifiers(&mut self, upserts: &[NullifierUpsert]) -> Result<()> {
        self.check_poisoned()?;
        for upsert in upserts {
            let state = match self.resolve(upsert.state_id).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    self.poisoned = true;
                    return Err(StateError::InvalidTransition {
                        state: format!("0x{}", hex::encode(upsert.state_id)),
                        detail: "nullifier for unknown state".into(),
                    });
                }
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            };
            if let Some(existing) = state.nullifier {
                if existing != upsert.nullifier {
                    self.poisoned = true;
                    return Err(StateError::NullifierConflict {
                        state: format!("0x{}", hex::encode(upsert.state_id)),
                    });
                }
                continue;
            }
            let mut updated = state;
            updated.nullifier = Some(upsert.nullifier);
            self.overlay.insert(upsert.state_id, updated);
            self.ops.push(WriteOp::PutNullifier {
                state_id: upsert.state_id,
                nullifier: upsert.nullifier,
            });
        }
        Ok(())
    }

    /// Flush all buffered writes atomically.
    ///
    /// Consumes the context; the per-contract lock is released afterwards.
    #[instrument(skip(self), fields(domain = %self.domain, ops = self.ops.len()))]
    pub async fn commit(self) -> Result<()> {
        if self.poisoned {
            return Err(StateError::InvalidTransition {
                state: "<context>".into(),
                detail: "context poisoned by an earlier failure".into(),
            });
        }
        if self.ops.is_empty() {
            return Ok(());
        }
        self.backend
            .apply(WriteBatch {
                domain: self.domain,
                contract: self.contract,
                ops: self.ops,
            })
            .await
    }

    /// The in-context version of a state, falling back to the backend.
    async fn resolve(&self, id: B256) -> Result<Option<StateRecord>> {
        if let Some(state) = self.overlay.get(&id) {
            return Ok(Some(state.clone()));
        }
        let stored = self
            .backend
            .get_states(&self.domain, self.contract, &[id])
            .await?;
        Ok(stored.into_iter().next())
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(StateError::InvalidTransition {
                state: "<context>".into(),
                detail: "context poisoned by an earlier failure".into(),
            });
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
