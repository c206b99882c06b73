//! Terminal-failure finalization.
//!
//! Failed and reverted transactions surface as `FailedWithMessage` receipts
//! handed to the receipt writer; its post-commit hook runs once the write
//! is durable.

use std::sync::Arc;

use tracing::instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::ports::ReceiptWriter;
use crate::types::Receipt;

/// Writes terminal receipts through the receipt writer port.
#[derive(Clone)]
pub struct Finalizer {
    receipts: Arc<dyn ReceiptWriter>,
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer").finish_non_exhaustive()
    }
}

impl Finalizer {
    /// Create a finalizer over a receipt writer.
    #[must_use]
    pub fn new(receipts: Arc<dyn ReceiptWriter>) -> Self {
        Self { receipts }
    }

    /// Record a terminal failure receipt for a transaction.
    #[instrument(skip(self))]
    pub async fn finalize_failure(&self, tx_id: Uuid, message: String) -> Result<()> {
        let post_commit = self
            .receipts
            .finalize_transactions(vec![Receipt::FailedWithMessage { tx_id, message }])
            .await?;
        post_commit();
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
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Captures receipts and records post-commit ordering.
    #[derive(Default)]
    struct CapturingWriter {
        receipts: Arc<Mutex<Vec<Receipt>>>,
        committed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl ReceiptWriter for CapturingWriter {
        async fn finalize_transactions(&self, receipts: Vec<Receipt>) -> Result<PostCommit> {
            self.receipts.lock().extend(receipts);
            let committed = Arc::clone(&self.committed);
            Ok(Box::new(move || *committed.lock() = true))
        }
    }

    #[tokio::test]
    async fn failure_receipt_carries_message_and_commits() {
        let writer = Arc::new(CapturingWriter::default());
        let finalizer = Finalizer::new(writer.clone());
        let tx_id = Uuid::new_v4();

        finalizer
            .finalize_failure(tx_id, "insufficient funds".into())
            .await
            .unwrap();

        let receipts = writer.receipts.lock();
        assert_eq!(
            *receipts,
            vec![Receipt::FailedWithMessage {
                tx_id,
                message: "insufficient funds".into()
            }]
        );
        assert!(*writer.committed.lock());
    }
}
