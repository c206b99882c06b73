//! In-flight transaction waiters.
//!
//! A waiter completes when its transaction's effects are durable: the
//! domain event path calls [`TransactionWaiters::complete`] from a
//! post-commit hook, so completion is visible to callers iff the commit
//! succeeded.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Registry of in-flight waiters, keyed by transaction ID.
#[derive(Debug, Clone, Default)]
pub struct TransactionWaiters {
    inflight: Arc<DashMap<Uuid, oneshot::Sender<()>>>,
}

impl TransactionWaiters {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for a transaction.
    ///
    /// Replaces any previous waiter for the same ID (the old one never
    /// fires).
    #[must_use]
    pub fn register(&self, tx_id: Uuid) -> InflightWaiter {
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(tx_id, tx);
        InflightWaiter { tx_id, rx }
    }

    /// Complete the waiter for a transaction, if one is registered.
    pub fn complete(&self, tx_id: Uuid) {
        if let Some((_, sender)) = self.inflight.remove(&tx_id) {
            debug!(tx = %tx_id, "completing in-flight waiter");
            let _ = sender.send(());
        }
    }

    /// Number of registered waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Whether no waiters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

/// One registered waiter.
#[derive(Debug)]
pub struct InflightWaiter {
    tx_id: Uuid,
    rx: oneshot::Receiver<()>,
}

impl InflightWaiter {
    /// Suspend until completion or cancellation.
    pub async fn wait(self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            result = self.rx => result.map_err(|_| EngineError::Internal(format!(
                "waiter for {} dropped without completion",
                self.tx_id
            ))),
            () = cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completion_wakes_waiter() {
        let waiters = TransactionWaiters::new();
        let id = Uuid::new_v4();
        let waiter = waiters.register(id);

        let waiters2 = waiters.clone();
        tokio::spawn(async move {
            waiters2.complete(id);
        });

        waiter.wait(&CancellationToken::new()).await.unwrap();
        assert!(waiters.is_empty());
    }

    #[tokio::test]
    async fn completion_without_waiter_is_noop() {
        let waiters = TransactionWaiters::new();
        waiters.complete(Uuid::new_v4());
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiter() {
        let waiters = TransactionWaiters::new();
        let waiter = waiters.register(Uuid::new_v4());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            waiter.wait(&cancel).await,
            Err(EngineError::Cancelled)
        ));
    }
}
