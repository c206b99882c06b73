//! Error types for key resolution and signing.

use thiserror::Error;

/// Errors surfaced by the key manager and signing modules.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyError {
    /// A key identifier was empty or malformed.
    #[error("invalid key identifier: {0}")]
    IdentifierInvalid(String),

    /// The signing module does not support the requested algorithm.
    #[error("unsupported algorithm: {0}")]
    AlgorithmUnsupported(String),

    /// The signing module does not support the requested payload type.
    #[error("unsupported payload type: {0}")]
    PayloadTypeUnsupported(String),

    /// No verifier was established for the requested algorithm.
    #[error("key verifier not established for algorithm {0}")]
    VerifierUnavailable(String),

    /// A repeated resolve returned a different key handle.
    ///
    /// This indicates corruption in the signing module's backing store and
    /// must never be retried.
    #[error("resolved {identifier:?} to different key handle expected={expected:?} received={received:?}")]
    HandleMismatch {
        /// The identifier being resolved.
        identifier: String,
        /// The handle recorded on first resolution.
        expected: String,
        /// The conflicting handle.
        received: String,
    },

    /// Key derivation or signing failed in the cryptography layer.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// A signature could not be parsed or recovered.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
}

/// Type alias for key management Results.
pub type Result<T> = std::result::Result<T, KeyError>;
