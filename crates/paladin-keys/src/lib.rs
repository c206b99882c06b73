//! Paladin key management.
//!
//! Keys live in a hierarchical namespace: the identifier `"treasury/alice"`
//! names the key `alice` inside the folder `treasury`. Resolution is lazy
//! and idempotent - folders and keys are assigned monotone indexes the first
//! time they are seen, and resolving the same identifier again always yields
//! the same key handle. A resolve that comes back with a *different* handle
//! indicates backing-store corruption and is fatal.
//!
//! Signing itself is delegated to a [`SigningModule`]. The in-memory module
//! in [`signer`] derives secp256k1 keys deterministically from a seed and is
//! what tests and single-node deployments use.

pub mod algorithms;
pub mod error;
pub mod manager;
pub mod signer;

pub use error::{KeyError, Result};
pub use manager::{KeyManager, KeyResolver};
pub use signer::{
    recover_opaque_rsv, InMemorySigningModule, KeyIdentifier, KeyPathSegment, ResolveKeyRequest,
    ResolvedKey, SignRequest, SignResponse, SigningModule,
};
