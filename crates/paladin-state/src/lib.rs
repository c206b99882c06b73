//! Paladin per-contract state store.
//!
//! Private transactions operate on immutable, content-addressed state records
//! that conform to a per-domain schema. This crate owns the full lifecycle of
//! those records:
//!
//! 1. **Schemas** are parsed from ABI-parameter-shaped definitions, given a
//!    canonical signature, and recorded idempotently per `(domain, signature)`.
//! 2. **States** are hashed from `(schema, data)` so equal content always
//!    yields the same ID, and move monotonically through
//!    `creating → confirmed` and `available → spending → spent`.
//! 3. **Domain contexts** provide the only mutation path: serialized per
//!    `(domain, contract)`, buffering writes with read-your-writes semantics,
//!    and flushing atomically on commit.
//!
//! # Modules
//!
//! - [`schema`] - Schema definitions, signatures and content-addressed IDs
//! - [`state`] - State records, locks, upserts and ID derivation
//! - [`query`] - Declarative JSON queries over labelled state fields
//! - [`context`] - The [`StateStore`] and its [`DomainContext`]
//! - [`store`] - The [`StateBackend`] port and its memory/postgres adapters
//! - [`error`] - Error types

pub mod context;
pub mod error;
pub mod query;
pub mod schema;
pub mod state;
pub mod store;

pub use context::{DomainContext, StateStore};
pub use error::{Result, StateError};
pub use query::StateQuery;
pub use schema::{Schema, SchemaDef, SchemaField};
pub use state::{NullifierUpsert, StateLock, StateRecord, StateUpsert};
pub use store::memory::MemoryBackend;
pub use store::{PrivateContractRecord, StateBackend, WriteBatch, WriteOp};
