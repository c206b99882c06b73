//! Paladin Private Transaction Engine
//!
//! Runs alongside a public ledger and orchestrates the lifecycle of private
//! transactions: assembling them from privately-held state, coordinating
//! off-ledger attestations between parties, and submitting a masked artifact
//! to the shared chain.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          ENGINE CORE                             │
//! │  ┌────────────┐   ┌───────────────┐   ┌───────────────────────┐  │
//! │  │   Stage    │──▶│    Domain     │──▶│   Domain Plugins      │  │
//! │  │   Engine   │   │    Manager    │   │ (in-proc / gRPC)      │  │
//! │  └────────────┘   └───────────────┘   └───────────────────────┘  │
//! │        ▲                 │  ▲                   │                │
//! │        │ waiters         ▼  │ events            ▼ callbacks      │
//! │  ┌────────────┐   ┌───────────────┐   ┌───────────────────────┐  │
//! │  │ Dependency │   │ Block Indexer │   │     State Store       │  │
//! │  │  Checker   │   │    (port)     │   │  (domain contexts)    │  │
//! │  └────────────┘   └───────────────┘   └───────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Data flows downward on the write path (user → stage engine → domain
//! plugin → state store) and upward on the event path (ledger events →
//! indexer → domain manager → waiter completion).
//!
//! # Modules
//!
//! - [`types`] - Private transactions, receipts, ID derivation
//! - [`error`] - Layered error types
//! - [`config`] - Configuration loading and validation
//! - [`retry`] - Indefinite retry with exponential backoff
//! - [`ports`] - Block indexer, receipt writer and submitter ports
//! - [`indexer`] - In-process event stream registry and delivery
//! - [`domains`] - Domain manager, records, contracts, encoding
//! - [`sequencer`] - The per-transaction stage machine
//! - [`service`] - Process wiring for the binary

pub mod config;
pub mod domains;
pub mod error;
pub mod indexer;
pub mod ports;
pub mod retry;
pub mod sequencer;
pub mod service;
pub mod types;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
