//! Dependency tracking between private transactions.
//!
//! Transactions declare pre-requisite IDs. The engine holds attestation
//! gathering back until every pre-req has dispatched, and completion back
//! until every pre-req has completed. The checker records each
//! transaction's current stage and wakes registered triggers on every
//! advance.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::sequencer::TxStage;

/// Tracks transaction stages and notifies dependents on advances.
#[derive(Debug, Clone, Default)]
pub struct DependencyChecker {
    inner: Arc<DepInner>,
}

#[derive(Debug, Default)]
struct DepInner {
    stages: DashMap<Uuid, TxStage>,
    advanced: Notify,
}

impl DependencyChecker {
    /// Create an empty checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transaction's stage and wake registered triggers.
    pub fn mark_stage(&self, tx_id: Uuid, stage: TxStage) {
        self.inner.stages.insert(tx_id, stage);
        self.inner.advanced.notify_waiters();
    }

    /// The recorded stage of a transaction, if any.
    #[must_use]
    pub fn stage_of(&self, tx_id: Uuid) -> Option<TxStage> {
        self.inner.stages.get(&tx_id).map(|s| *s)
    }

    /// The pre-reqs that do NOT yet satisfy `predicate`.
    pub fn pre_reqs_match_condition<F>(&self, pre_reqs: &[Uuid], predicate: F) -> Vec<Uuid>
    where
        F: Fn(Option<TxStage>) -> bool,
    {
        pre_reqs
            .iter()
            .filter(|id| !predicate(self.stage_of(**id)))
            .copied()
            .collect()
    }

    /// Register for edge notifications on pre-req advances.
    #[must_use]
    pub fn register_pre_req_trigger(&self, pre_reqs: &[Uuid]) -> PreReqTrigger {
        PreReqTrigger {
            checker: self.clone(),
            pre_reqs: pre_reqs.to_vec(),
        }
    }

    /// Suspend until every pre-req has reached `min_stage`.
    ///
    /// A pre-req that lands in a terminal failure stage fails the wait: the
    /// dependent cannot make progress on top of it.
    pub async fn wait_for_pre_reqs(
        &self,
        pre_reqs: &[Uuid],
        min_stage: TxStage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if pre_reqs.is_empty() {
            return Ok(());
        }
        loop {
            let notified = self.inner.advanced.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut pending = 0usize;
            for id in pre_reqs {
                match self.stage_of(*id) {
                    Some(TxStage::Reverted | TxStage::Failed) => {
                        return Err(EngineError::Revert(format!(
                            "pre-requisite transaction {id} failed"
                        )));
                    }
                    Some(stage) if stage >= min_stage => {}
                    _ => pending += 1,
                }
            }
            if pending == 0 {
                return Ok(());
            }
            debug!(pending, ?min_stage, "waiting on pre-requisites");

            tokio::select! {
                () = &mut notified => {}
                () = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }
}

/// An edge-notification handle over a fixed set of pre-reqs.
#[derive(Debug)]
pub struct PreReqTrigger {
    checker: DependencyChecker,
    pre_reqs: Vec<Uuid>,
}

impl PreReqTrigger {
    /// Suspend until any pre-req advances, then return the ones still not
    /// satisfying `predicate`.
    pub async fn next_unsatisfied<F>(&self, predicate: F) -> Vec<Uuid>
    where
        F: Fn(Option<TxStage>) -> bool,
    {
        let outstanding = self.checker.pre_reqs_match_condition(&self.pre_reqs, &predicate);
        if outstanding.is_empty() {
            return outstanding;
        }
        self.checker.inner.advanced.notified().await;
        self.checker.pre_reqs_match_condition(&self.pre_reqs, &predicate)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_completes_when_pre_reqs_advance() {
        let checker = DependencyChecker::new();
        let pre_req = Uuid::new_v4();

        let waiter = checker.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_pre_reqs(&[pre_req], TxStage::Dispatch, &CancellationToken::new())
                .await
        });

        // Not yet at dispatch
        checker.mark_stage(pre_req, TxStage::Assemble);
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        checker.mark_stage(pre_req, TxStage::Dispatch);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_pre_req_fails_the_wait() {
        let checker = DependencyChecker::new();
        let pre_req = Uuid::new_v4();
        checker.mark_stage(pre_req, TxStage::Failed);

        let err = checker
            .wait_for_pre_reqs(&[pre_req], TxStage::Complete, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Revert(_)));
    }

    #[test]
    fn match_condition_filters_unsatisfied() {
        let checker = DependencyChecker::new();
        let done = Uuid::new_v4();
        let pending = Uuid::new_v4();
        checker.mark_stage(done, TxStage::Complete);
        checker.mark_stage(pending, TxStage::Assemble);

        let outstanding = checker.pre_reqs_match_condition(&[done, pending], |stage| {
            stage.is_some_and(|s| s >= TxStage::Complete)
        });
        assert_eq!(outstanding, vec![pending]);
    }

    #[tokio::test]
    async fn empty_pre_reqs_never_block() {
        let checker = DependencyChecker::new();
        checker
            .wait_for_pre_reqs(&[], TxStage::Complete, &CancellationToken::new())
            .await
            .unwrap();
    }
}
