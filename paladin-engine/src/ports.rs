//! Ports to external collaborators.
//!
//! The block indexer, receipt writer and base-ledger submitter are external
//! systems; these traits name the contracts the engine relies on. The
//! in-process implementations live in [`crate::indexer`] and in test code.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use uuid::Uuid;

use paladin_plugin::LedgerEvent;

use crate::error::Result;
use crate::types::{PreparedLedgerTransaction, Receipt};

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK INDEXER
// ═══════════════════════════════════════════════════════════════════════════════

/// One source of an event stream: an ABI, optionally pinned to an address.
#[derive(Debug, Clone)]
pub struct EventStreamSource {
    /// Only logs from this address match, when set.
    pub address: Option<Address>,
    /// ABI JSON describing the events to decode.
    pub abi_json: String,
}

/// Definition of an internal event stream.
#[derive(Debug, Clone)]
pub struct EventStreamDefinition {
    /// Stream name; embeds the combined ABI hash so an ABI change yields a
    /// fresh stream.
    pub name: String,
    /// The stream's sources.
    pub sources: Vec<EventStreamSource>,
}

/// One ordered batch of decoded events delivered to a stream handler.
#[derive(Debug, Clone)]
pub struct EventDeliveryBatch {
    /// Unique batch ID.
    pub batch_id: Uuid,
    /// The stream the batch belongs to.
    pub stream: String,
    /// Ordered events.
    pub events: Vec<LedgerEvent>,
}

/// Deferred work to run after the indexer checkpoint commits.
pub type PostCommit = Box<dyn FnOnce() + Send>;

/// Consumer of one event stream.
#[async_trait]
pub trait EventStreamHandler: Send + Sync + 'static {
    /// Process one ordered batch; the returned hook runs after the
    /// indexer's checkpoint advances.
    async fn handle_event_batch(&self, batch: EventDeliveryBatch) -> Result<PostCommit>;
}

/// The block indexer contract: ordered event delivery per stream.
#[async_trait]
pub trait BlockIndexer: Send + Sync + 'static {
    /// Register (idempotently) an internal event stream.
    ///
    /// A name never seen before replays history from the start; registering
    /// a fresh name for a source that previously streamed under another
    /// name tombstones the old stream.
    async fn add_event_stream(
        &self,
        definition: EventStreamDefinition,
        handler: std::sync::Arc<dyn EventStreamHandler>,
    ) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECEIPTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Writer of finalization receipts (external collaborator).
#[async_trait]
pub trait ReceiptWriter: Send + Sync + 'static {
    /// Persist receipts; the returned hook runs after commit.
    async fn finalize_transactions(&self, receipts: Vec<Receipt>) -> Result<PostCommit>;
}

/// A receipt writer that only logs. Used when no receipt store is wired.
#[derive(Debug, Default, Clone)]
pub struct LoggingReceiptWriter;

#[async_trait]
impl ReceiptWriter for LoggingReceiptWriter {
    async fn finalize_transactions(&self, receipts: Vec<Receipt>) -> Result<PostCommit> {
        for receipt in &receipts {
            match receipt {
                Receipt::FailedWithMessage { tx_id, message } => {
                    tracing::warn!(tx = %tx_id, %message, "transaction finalized as failed");
                }
            }
        }
        Ok(Box::new(|| {}))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BASE LEDGER SUBMISSION
// ═══════════════════════════════════════════════════════════════════════════════

/// The base-ledger submission layer (external collaborator).
#[async_trait]
pub trait BaseLedgerSubmitter: Send + Sync + 'static {
    /// Submit a signed artifact; returns the base-ledger transaction hash.
    async fn submit(&self, tx_id: Uuid, prepared: &PreparedLedgerTransaction) -> Result<B256>;
}
