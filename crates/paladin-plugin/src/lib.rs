//! Paladin plugin control plane.
//!
//! Domain implementations run out of process. This crate hosts them:
//!
//! 1. The controller binds a local gRPC endpoint (`unix:` socket preferred,
//!    `tcp4:`/`tcp6:` loopback fallback).
//! 2. Exactly one *loader* attaches on [`pb::PluginLoaderInit`], gated by a
//!    UUID minted at controller startup, and receives a stream of
//!    [`pb::PluginLoad`] instructions telling it what to spawn.
//! 3. Each spawned plugin connects back on the `ConnectDomain` stream,
//!    registers with its assigned instance UUID, and exchanges correlated
//!    [`pb::DomainMessage`] envelopes with the controller in both directions.
//!
//! The engine never sees any of that plumbing: it talks to a
//! [`api::DomainPlugin`] trait object, which the gRPC bridge
//! ([`remote::RemoteDomain`]) and in-process domains both implement.
//!
//! # Modules
//!
//! - [`pb`] - Generated protobuf/tonic wire types
//! - [`api`] - The `DomainPlugin` and `DomainCallbacks` traits
//! - [`transport`] - Listen address parsing, binding, client target URLs
//! - [`controller`] - The plugin controller itself
//! - [`remote`] - Stream bridge implementing `DomainPlugin` over gRPC
//! - [`error`] - Error types

pub mod api;
pub mod controller;
pub mod error;
pub mod remote;
pub mod transport;

/// Generated protobuf/tonic code for the control plane.
#[allow(clippy::pedantic, clippy::nursery, missing_docs)]
pub mod pb {
    tonic::include_proto!("paladin.plugin.v1");
}

pub use api::{DomainCallbacks, DomainPlugin, LedgerEvent};
pub use controller::{LibraryType, PluginConfig, PluginController, PluginControllerConfig};
pub use error::{PluginError, Result};
pub use transport::ListenAddress;
