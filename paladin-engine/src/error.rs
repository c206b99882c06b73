//! Layered error types for the engine.
//!
//! [`EngineError`] carries the originating kind end-to-end: domain RPC
//! failures surface to callers with their kind intact, and `Revert` carries
//! the domain-provided reason verbatim.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the engine core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Configuration failed validation at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A domain was asked to serve before its init loop completed.
    #[error("domain {0} not initialized")]
    DomainNotInitialized(String),

    /// No domain or contract is known at the given address.
    #[error("no contract known at {0}")]
    ContractNotFound(String),

    /// A malformed on-wire address.
    #[error("invalid address: {0}")]
    AddressInvalid(String),

    /// The transaction is missing required fields for its current stage.
    #[error("transaction {tx} incomplete: {detail}")]
    TxIncomplete {
        /// The transaction.
        tx: Uuid,
        /// What was missing.
        detail: String,
    },

    /// The domain reverted the transaction; the reason is verbatim.
    #[error("reverted: {0}")]
    Revert(String),

    /// A named attestation was never collected.
    #[error("attestation {0:?} missing")]
    AttestationMissing(String),

    /// Two conflicting results arrived for the same attestation.
    #[error("attestation {0:?} has conflicting results")]
    AttestationConflict(String),

    /// A prepare response carried both or neither of invoke/deploy.
    #[error("prepare must return exactly one of transaction or deploy")]
    PrepareAmbiguous,

    /// No signer was returned and the submit mode has no fallback.
    #[error("no signer for prepared transaction (submit mode {0})")]
    NoSigner(String),

    /// A factory or function ABI document could not be parsed.
    #[error("invalid ABI: {0}")]
    AbiInvalid(String),

    /// An unsupported encoding kind or definition.
    #[error("unsupported encoding: {0}")]
    EncodingUnsupported(String),

    /// An unsupported signature recovery algorithm combination.
    #[error("unsupported recovery algorithm: {algorithm}/{payload_type}")]
    RecoverAlgorithmUnsupported {
        /// The requested algorithm.
        algorithm: String,
        /// The requested payload type.
        payload_type: String,
    },

    /// The operation was cancelled by scope shutdown.
    #[error("cancelled")]
    Cancelled,

    /// State store failure.
    #[error(transparent)]
    State(#[from] paladin_state::StateError),

    /// Plugin transport or domain failure.
    #[error(transparent)]
    Plugin(#[from] paladin_plugin::PluginError),

    /// Key resolution or signing failure.
    #[error(transparent)]
    Keys(#[from] paladin_keys::KeyError),

    /// JSON serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Type alias for engine Results.
pub type Result<T> = std::result::Result<T, EngineError>;
