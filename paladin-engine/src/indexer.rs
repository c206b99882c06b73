//! In-process event stream registry and delivery.
//!
//! [`ManualBlockIndexer`] implements the [`BlockIndexer`] port for embedded
//! deployments and tests: callers push decoded ledger events in order, and
//! the indexer fans each batch out to every live stream whose sources match,
//! sequentially, invoking post-commit hooks after the per-stream checkpoint
//! advances.
//!
//! Stream identity follows the ABI: a stream name not seen before replays
//! the full event history from the start, and registering a fresh name for
//! a domain that previously streamed under another name tombstones the old
//! stream (delivery stops; the checkpoint row is kept).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use paladin_plugin::LedgerEvent;

use crate::error::Result;
use crate::ports::{BlockIndexer, EventDeliveryBatch, EventStreamDefinition, EventStreamHandler};

// ═══════════════════════════════════════════════════════════════════════════════
// STREAM MATCHING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct SourceMatcher {
    address: Option<Address>,
    event_names: HashSet<String>,
}

impl SourceMatcher {
    fn matches(&self, event: &LedgerEvent) -> bool {
        if let Some(address) = self.address {
            let event_address: Option<Address> = event.address.parse().ok();
            if event_address != Some(address) {
                return false;
            }
        }
        self.event_names.contains(&event.event_name)
    }
}

/// Names of the events declared in an ABI JSON document.
fn abi_event_names(abi_json: &str) -> HashSet<String> {
    serde_json::from_str::<serde_json::Value>(abi_json)
        .ok()
        .and_then(|abi| {
            abi.as_array().map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.get("type").and_then(serde_json::Value::as_str) == Some("event"))
                    .filter_map(|e| e.get("name").and_then(serde_json::Value::as_str))
                    .map(ToString::to_string)
                    .collect()
            })
        })
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════════
// INDEXER
// ═══════════════════════════════════════════════════════════════════════════════

struct StreamEntry {
    handler: Arc<dyn EventStreamHandler>,
    matchers: Vec<SourceMatcher>,
    tombstoned: bool,
    replayed_from_start: bool,
    checkpoint: u64,
}

#[derive(Default)]
struct IndexerInner {
    streams: BTreeMap<String, StreamEntry>,
    history: Vec<LedgerEvent>,
}

/// Embedded block indexer: ordered, sequential batch delivery.
#[derive(Default)]
pub struct ManualBlockIndexer {
    inner: Mutex<IndexerInner>,
}

impl std::fmt::Debug for ManualBlockIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualBlockIndexer").finish_non_exhaustive()
    }
}

impl ManualBlockIndexer {
    /// Create an empty indexer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one ordered batch of decoded events.
    ///
    /// Every live stream whose sources match receives its slice of the
    /// batch, sequentially, in stream-name order. A handler error aborts
    /// the delivery (the caller owns retry); post-commit hooks only run for
    /// streams whose checkpoint advanced.
    #[instrument(skip_all, fields(events = events.len()))]
    pub async fn deliver(&self, events: Vec<LedgerEvent>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.history.extend(events.iter().cloned());

        let stream_names: Vec<String> = inner.streams.keys().cloned().collect();
        for name in stream_names {
            let Some(entry) = inner.streams.get(&name) else { continue };
            if entry.tombstoned {
                continue;
            }
            let matched: Vec<LedgerEvent> = events
                .iter()
                .filter(|ev| entry.matchers.iter().any(|m| m.matches(ev)))
                .cloned()
                .collect();
            if matched.is_empty() {
                continue;
            }
            let handler = Arc::clone(&entry.handler);
            let batch = EventDeliveryBatch {
                batch_id: Uuid::new_v4(),
                stream: name.clone(),
                events: matched,
            };
            debug!(stream = %name, batch = %batch.batch_id, "delivering event batch");
            let post_commit = handler.handle_event_batch(batch).await?;
            if let Some(entry) = inner.streams.get_mut(&name) {
                entry.checkpoint += 1;
            }
            post_commit();
        }
        Ok(())
    }

    /// Names of live (non-tombstoned) streams.
    pub async fn live_streams(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .streams
            .iter()
            .filter(|(_, e)| !e.tombstoned)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether a stream replayed history from the start when registered.
    pub async fn replayed_from_start(&self, name: &str) -> bool {
        self.inner
            .lock()
            .await
            .streams
            .get(name)
            .is_some_and(|e| e.replayed_from_start)
    }

    /// Whether a stream has been tombstoned by a successor.
    pub async fn is_tombstoned(&self, name: &str) -> bool {
        self.inner
            .lock()
            .await
            .streams
            .get(name)
            .is_some_and(|e| e.tombstoned)
    }
}

#[async_trait]
impl BlockIndexer for ManualBlockIndexer {
    async fn add_event_stream(
        &self,
        definition: EventStreamDefinition,
        handler: Arc<dyn EventStreamHandler>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if let Some(entry) = inner.streams.get_mut(&definition.name) {
            // Same ABI, same name: re-registration just refreshes the handler
            entry.handler = handler;
            debug!(stream = %definition.name, "event stream re-registered");
            return Ok(());
        }

        // A fresh name supersedes any previous stream of the same family
        // (same name prefix before the ABI hash). Old streams stop getting
        // batches but keep their checkpoint rows.
        if let Some((family, _)) = definition.name.rsplit_once('_') {
            let family_prefix = format!("{family}_");
            for (name, entry) in &mut inner.streams {
                if !entry.tombstoned && name.starts_with(&family_prefix) {
                    warn!(superseded = %name, successor = %definition.name,
                          "tombstoning event stream after ABI change");
                    entry.tombstoned = true;
                }
            }
        }

        let matchers = definition
            .sources
            .iter()
            .map(|source| SourceMatcher {
                address: source.address,
                event_names: abi_event_names(&source.abi_json),
            })
            .collect();

        let mut entry = StreamEntry {
            handler,
            matchers,
            tombstoned: false,
            replayed_from_start: false,
            checkpoint: 0,
        };

        // New streams replay from the start of history
        let replay: Vec<LedgerEvent> = inner
            .history
            .iter()
            .filter(|ev| entry.matchers.iter().any(|m| m.matches(ev)))
            .cloned()
            .collect();
        if !replay.is_empty() {
            let batch = EventDeliveryBatch {
                batch_id: Uuid::new_v4(),
                stream: definition.name.clone(),
                events: replay,
            };
            info!(stream = %definition.name, events = batch.events.len(),
                  "replaying history into fresh event stream");
            let post_commit = entry.handler.handle_event_batch(batch).await?;
            entry.checkpoint += 1;
            post_commit();
        }
        entry.replayed_from_start = true;

        inner.streams.insert(definition.name, entry);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PostCommit;
    use parking_lot::Mutex as SyncMutex;

    const TEST_ABI: &str =
        r#"[{"type":"event","name":"Ping","inputs":[]},{"type":"function","name":"poke"}]"#;

    /// Records delivered batches and post-commit ordering.
    #[derive(Default)]
    struct RecordingHandler {
        batches: Arc<SyncMutex<Vec<Vec<String>>>>,
        committed: Arc<SyncMutex<usize>>,
    }

    #[async_trait]
    impl EventStreamHandler for RecordingHandler {
        async fn handle_event_batch(&self, batch: EventDeliveryBatch) -> Result<PostCommit> {
            self.batches
                .lock()
                .push(batch.events.iter().map(|e| e.event_name.clone()).collect());
            let committed = Arc::clone(&self.committed);
            Ok(Box::new(move || *committed.lock() += 1))
        }
    }

    fn ping(address: &str) -> LedgerEvent {
        LedgerEvent {
            address: address.into(),
            block_number: 1,
            log_index: 0,
            transaction_hash: "0x00".into(),
            event_name: "Ping".into(),
            data: serde_json::Value::Null,
        }
    }

    fn definition(name: &str) -> EventStreamDefinition {
        EventStreamDefinition {
            name: name.into(),
            sources: vec![crate::ports::EventStreamSource {
                address: None,
                abi_json: TEST_ABI.into(),
            }],
        }
    }

    #[tokio::test]
    async fn delivers_in_order_with_post_commit() {
        let indexer = ManualBlockIndexer::new();
        let handler = Arc::new(RecordingHandler::default());
        indexer
            .add_event_stream(definition("domain_x_aaaa"), handler.clone())
            .await
            .unwrap();

        indexer.deliver(vec![ping("0x01")]).await.unwrap();
        indexer.deliver(vec![ping("0x02")]).await.unwrap();

        assert_eq!(handler.batches.lock().len(), 2);
        assert_eq!(*handler.committed.lock(), 2);
    }

    #[tokio::test]
    async fn abi_events_filter_unrelated_logs() {
        let indexer = ManualBlockIndexer::new();
        let handler = Arc::new(RecordingHandler::default());
        indexer
            .add_event_stream(definition("domain_x_aaaa"), handler.clone())
            .await
            .unwrap();

        let mut other = ping("0x01");
        other.event_name = "Pong".into();
        indexer.deliver(vec![other]).await.unwrap();
        assert!(handler.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn fresh_stream_replays_and_supersedes() {
        let indexer = ManualBlockIndexer::new();
        let first = Arc::new(RecordingHandler::default());
        indexer
            .add_event_stream(definition("domain_x_aaaa"), first.clone())
            .await
            .unwrap();
        indexer.deliver(vec![ping("0x01")]).await.unwrap();

        // ABI change: new hash suffix, same family
        let second = Arc::new(RecordingHandler::default());
        indexer
            .add_event_stream(definition("domain_x_bbbb"), second.clone())
            .await
            .unwrap();

        // The fresh stream replayed history from the start
        assert!(indexer.replayed_from_start("domain_x_bbbb").await);
        assert_eq!(second.batches.lock().len(), 1);

        // The old stream is tombstoned and receives nothing further
        assert!(indexer.is_tombstoned("domain_x_aaaa").await);
        indexer.deliver(vec![ping("0x02")]).await.unwrap();
        assert_eq!(first.batches.lock().len(), 1);
        assert_eq!(second.batches.lock().len(), 2);
    }
}
