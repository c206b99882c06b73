//! Error types for the plugin control plane.

use thiserror::Error;

/// Errors surfaced by the plugin controller and domain bridges.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// A configured plugin name contains characters outside `[A-Za-z0-9_-]`
    /// or exceeds the length limit.
    #[error("invalid plugin name: {0:?}")]
    NameInvalid(String),

    /// The listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    AddressInvalid(String),

    /// A Unix socket path exceeds what every supported platform can bind.
    #[error("socket path too long ({length} bytes, max {max}): {path}")]
    SocketPathTooLong {
        /// The offending path.
        path: String,
        /// Its length in bytes.
        length: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// The transport could not be bound.
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        /// The address that failed to bind.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A loader attached with an ID other than the one minted at startup.
    #[error("loader UUID mismatch")]
    LoaderMismatch,

    /// A second loader attached with the correct ID while one is active.
    #[error("loader already active")]
    LoaderDuplicate,

    /// A plugin reported a fatal load failure.
    #[error("plugin {plugin} failed to load: {message}")]
    LoadFailed {
        /// The plugin that failed.
        plugin: String,
        /// The loader-reported failure message.
        message: String,
    },

    /// The operation was cancelled by scope shutdown.
    #[error("cancelled")]
    Cancelled,

    /// The domain stream is gone or the correlated response never arrived.
    #[error("plugin transport error: {0}")]
    Transport(String),

    /// The domain returned an error for a correlated request.
    #[error("domain error: {0}")]
    Domain(String),

    /// A response arrived with an unexpected payload type.
    #[error("unexpected response payload for {0}")]
    UnexpectedResponse(&'static str),
}

/// Type alias for plugin control plane Results.
pub type Result<T> = std::result::Result<T, PluginError>;

impl From<tonic::Status> for PluginError {
    fn from(status: tonic::Status) -> Self {
        Self::Transport(status.to_string())
    }
}

impl From<tonic::transport::Error> for PluginError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
