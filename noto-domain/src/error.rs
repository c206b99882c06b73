//! Error types for the Noto domain.

use paladin_plugin::PluginError;
use thiserror::Error;

/// Errors raised while servicing engine requests.
///
/// [`NotoError::InsufficientFunds`] is special-cased by the assemble path:
/// it becomes a REVERT assembly result with a reason, not a request error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NotoError {
    /// Transaction parameters failed validation.
    #[error("invalid parameters: {0}")]
    ParamInvalid(String),

    /// The contract (or domain) configuration could not be parsed.
    #[error("invalid noto configuration: {0}")]
    ConfigInvalid(String),

    /// The function name is not one this domain implements.
    #[error("unknown function: {0}")]
    FunctionUnknown(String),

    /// The requested operation is disabled by the contract configuration.
    #[error("{0} not allowed by contract configuration")]
    NotAllowed(&'static str),

    /// A party's verifier was not in the resolved set.
    #[error("verifier not resolved for {0:?}")]
    VerifierMissing(String),

    /// A named attestation was not collected.
    #[error("attestation {0:?} not found")]
    AttestationMissing(String),

    /// The sender does not own enough coins to cover the amount.
    #[error("insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds {
        /// Amount the transaction requires.
        needed: String,
        /// Total the sender has available.
        available: String,
    },

    /// Input and output coin values do not balance for the function.
    #[error("amounts do not balance: {0}")]
    AmountMismatch(String),

    /// An input coin is not owned by the transaction sender.
    #[error("coin {0} not owned by sender")]
    OwnershipViolation(String),

    /// The sender signature did not verify.
    #[error("sender signature invalid: {0}")]
    SignatureInvalid(String),

    /// A malformed coin or event payload.
    #[error("malformed data: {0}")]
    DataInvalid(String),

    /// The domain was asked to operate before initialization completed.
    #[error("domain not configured")]
    NotConfigured,

    /// A callback into the engine failed.
    #[error(transparent)]
    Callback(#[from] PluginError),

    /// JSON serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Type alias for Noto Results.
pub type Result<T> = std::result::Result<T, NotoError>;

impl From<NotoError> for PluginError {
    fn from(err: NotoError) -> Self {
        match err {
            NotoError::Callback(inner) => inner,
            other => Self::Domain(other.to_string()),
        }
    }
}
