//! Error types for the state store.

use thiserror::Error;

/// Errors surfaced by the state store and its backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    /// A schema definition failed validation.
    #[error("invalid schema: {0}")]
    SchemaInvalid(String),

    /// A schema referenced by ID is not recorded.
    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    /// A state query document failed validation.
    #[error("invalid query: {0}")]
    QueryInvalid(String),

    /// A state lifecycle transition that the monotone model forbids.
    ///
    /// The enclosing domain context is poisoned: its buffered writes are
    /// discarded without commit.
    #[error("invalid state transition for {state}: {detail}")]
    InvalidTransition {
        /// The state the transition was attempted on.
        state: String,
        /// What went wrong.
        detail: String,
    },

    /// A second, different nullifier was supplied for a state.
    #[error("nullifier conflict for state {state}")]
    NullifierConflict {
        /// The state that already has a nullifier.
        state: String,
    },

    /// Database error from the postgres backend.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Type alias for state store Results.
pub type Result<T> = std::result::Result<T, StateError>;
