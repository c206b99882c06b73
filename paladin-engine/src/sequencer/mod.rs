//! The per-transaction stage machine.
//!
//! Drives one private transaction through
//! `Init|InitDeploy → Assemble → GatherAttestations → Endorse → Prepare →
//! Dispatch → AwaitConfirm → Complete`, with terminal `Reverted` and
//! `Failed` stages.
//!
//! Every stage cycle produces one of three outcomes: advance to a new
//! stage, re-run the current stage with new input (e.g. a signature an
//! endorser demanded), or wait on an external signal (attestation,
//! dependency, block confirmation). Stages are idempotent: re-entering
//! with the same inputs yields the same outputs, salts excepted (selected
//! once at assembly and stored with the states).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use paladin_keys::KeyResolver;

use crate::domains::{AssembleOutcome, Domain, DomainManager, EndorseOutcome};
use crate::error::{EngineError, Result};
use crate::ports::{BaseLedgerSubmitter, ReceiptWriter};
use crate::retry::RetryPolicy;
use crate::sequencer::waiter::InflightWaiter;
use crate::types::PrivateTransaction;

pub mod attestation;
pub mod dependency;
pub mod finalize;
pub mod waiter;

pub use dependency::DependencyChecker;
pub use finalize::Finalizer;

use paladin_plugin::pb;

// ═══════════════════════════════════════════════════════════════════════════════
// STAGES
// ═══════════════════════════════════════════════════════════════════════════════

/// The stages a private transaction moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxStage {
    /// Created, not yet started.
    New,
    /// Requesting required verifiers for an invoke.
    Init,
    /// Requesting required verifiers for a deployment.
    InitDeploy,
    /// Selecting states and building the attestation plan.
    Assemble,
    /// Collecting signatures from the plan's parties.
    GatherAttestations,
    /// Endorser re-validation.
    Endorse,
    /// Producing the base-ledger artifact.
    Prepare,
    /// Handing the artifact to the submission layer.
    Dispatch,
    /// Waiting for on-ledger confirmation.
    AwaitConfirm,
    /// Effects are durable.
    Complete,
    /// Terminal: the domain reverted the transaction.
    Reverted,
    /// Terminal: a stage failed fatally.
    Failed,
}

/// What one stage cycle decided.
#[derive(Debug)]
enum StageOutcome {
    /// Advance to the given stage.
    NewStage(TxStage),
    /// Re-run the current stage with additional input.
    NewAction,
    /// Blocked on an external event; retry after the wait.
    Wait,
}

/// Terminal result of driving a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// All effects durable.
    Complete,
    /// Domain-reverted with the given reason.
    Reverted(String),
    /// Failed fatally with the given message.
    Failed(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// STAGE ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

struct EngineInner {
    manager: DomainManager,
    keys: Arc<dyn KeyResolver>,
    submitter: Arc<dyn BaseLedgerSubmitter>,
    finalizer: Finalizer,
    dependencies: DependencyChecker,
    park_retry: RetryPolicy,
    cancel: CancellationToken,
}

/// Drives private transactions through their stages.
#[derive(Clone)]
pub struct StageEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for StageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageEngine").finish_non_exhaustive()
    }
}

impl StageEngine {
    /// Create a stage engine over the domain manager and collaborators.
    #[must_use]
    pub fn new(
        manager: DomainManager,
        keys: Arc<dyn KeyResolver>,
        submitter: Arc<dyn BaseLedgerSubmitter>,
        receipts: Arc<dyn ReceiptWriter>,
        park_retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                manager,
                keys,
                submitter,
                finalizer: Finalizer::new(receipts),
                dependencies: DependencyChecker::new(),
                park_retry,
                cancel,
            }),
        }
    }

    /// The dependency checker shared by all transactions.
    #[must_use]
    pub fn dependencies(&self) -> &DependencyChecker {
        &self.inner.dependencies
    }

    /// Spawn a transaction onto its own task.
    pub fn spawn_transaction(
        &self,
        tx: PrivateTransaction,
    ) -> tokio::task::JoinHandle<Result<TxOutcome>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.execute(tx).await })
    }

    /// Drive a transaction to a terminal outcome.
    ///
    /// Stage failures finalize as `FailedWithMessage` receipts and return
    /// [`TxOutcome::Failed`]; only cancellation surfaces as an error.
    #[instrument(skip_all, fields(tx = %tx.id, domain = %tx.domain))]
    pub async fn execute(&self, mut tx: PrivateTransaction) -> Result<TxOutcome> {
        let domain = self.inner.manager.domain(&tx.domain)?;
        let mut stage = if tx.contract.is_some() {
            TxStage::Init
        } else {
            TxStage::InitDeploy
        };
        self.inner.dependencies.mark_stage(tx.id, stage);

        // Registered at dispatch, consumed at await-confirm
        let mut waiter: Option<InflightWaiter> = None;
        let mut park_attempts: u32 = 0;

        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let cycle = self
                .run_stage(&domain, &mut tx, stage, &mut waiter)
                .await;
            let outcome = match cycle {
                Ok(outcome) => outcome,
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(EngineError::Revert(reason)) => {
                    return self.finish_reverted(&mut tx, reason).await;
                }
                Err(error) => {
                    return self.finish_failed(&mut tx, error.to_string()).await;
                }
            };

            match outcome {
                StageOutcome::NewStage(TxStage::Complete) => {
                    self.inner.dependencies.mark_stage(tx.id, TxStage::Complete);
                    info!("transaction complete");
                    return Ok(TxOutcome::Complete);
                }
                StageOutcome::NewStage(next) => {
                    debug!(from = ?stage, to = ?next, "stage advance");
                    stage = next;
                    park_attempts = 0;
                    self.inner.dependencies.mark_stage(tx.id, stage);
                }
                StageOutcome::NewAction => {
                    debug!(?stage, "re-running stage with new input");
                }
                StageOutcome::Wait => {
                    park_attempts = park_attempts.saturating_add(1);
                    let delay = self.inner.park_retry.delay(park_attempts);
                    debug!(?stage, ?delay, "parked, waiting before retry");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.inner.cancel.cancelled() => return Err(EngineError::Cancelled),
                    }
                }
            }
        }
    }

    async fn run_stage(
        &self,
        domain: &Arc<Domain>,
        tx: &mut PrivateTransaction,
        stage: TxStage,
        waiter: &mut Option<InflightWaiter>,
    ) -> Result<StageOutcome> {
        match stage {
            TxStage::New | TxStage::Init => self.stage_init(domain, tx).await,
            TxStage::InitDeploy => self.stage_init_deploy(domain, tx).await,
            TxStage::Assemble => self.stage_assemble(domain, tx).await,
            TxStage::GatherAttestations => self.stage_gather(tx).await,
            TxStage::Endorse => self.stage_endorse(domain, tx).await,
            TxStage::Prepare => self.stage_prepare(domain, tx).await,
            TxStage::Dispatch => self.stage_dispatch(tx, waiter).await,
            TxStage::AwaitConfirm => self.stage_await_confirm(tx, waiter).await,
            TxStage::Complete | TxStage::Reverted | TxStage::Failed => Err(
                EngineError::Internal(format!("stage {stage:?} is terminal")),
            ),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STAGES
    // ═══════════════════════════════════════════════════════════════════════

    async fn stage_init(
        &self,
        domain: &Arc<Domain>,
        tx: &mut PrivateTransaction,
    ) -> Result<StageOutcome> {
        domain.init_transaction(tx).await?;
        tx.verifiers =
            attestation::resolve_verifiers(self.inner.keys.as_ref(), &tx.required_verifiers)
                .await?;
        Ok(StageOutcome::NewStage(TxStage::Assemble))
    }

    async fn stage_init_deploy(
        &self,
        domain: &Arc<Domain>,
        tx: &mut PrivateTransaction,
    ) -> Result<StageOutcome> {
        domain.init_deploy(tx).await?;
        tx.verifiers =
            attestation::resolve_verifiers(self.inner.keys.as_ref(), &tx.required_verifiers)
                .await?;
        Ok(StageOutcome::NewStage(TxStage::Prepare))
    }

    async fn stage_assemble(
        &self,
        domain: &Arc<Domain>,
        tx: &mut PrivateTransaction,
    ) -> Result<StageOutcome> {
        match domain.assemble_transaction(tx).await? {
            AssembleOutcome::Assembled => {
                Ok(StageOutcome::NewStage(TxStage::GatherAttestations))
            }
            AssembleOutcome::Revert(reason) => Err(EngineError::Revert(reason)),
            AssembleOutcome::Park => Ok(StageOutcome::Wait),
        }
    }

    async fn stage_gather(&self, tx: &mut PrivateTransaction) -> Result<StageOutcome> {
        // Attestations wait for every pre-req to have dispatched
        self.inner
            .dependencies
            .wait_for_pre_reqs(&tx.pre_reqs, TxStage::Dispatch, &self.inner.cancel)
            .await?;
        attestation::gather_signatures(
            self.inner.keys.as_ref(),
            &tx.attestation_plan,
            &mut tx.attestations,
        )
        .await?;
        Ok(StageOutcome::NewStage(TxStage::Endorse))
    }

    async fn stage_endorse(
        &self,
        domain: &Arc<Domain>,
        tx: &mut PrivateTransaction,
    ) -> Result<StageOutcome> {
        let outstanding: Vec<pb::AttestationRequest> = tx
            .attestation_plan
            .iter()
            .filter(|request| request.attestation_type() == pb::AttestationType::Endorse)
            .filter(|request| {
                // A signature collected on ENDORSER_SIGN feedback shares the
                // request name; only an actual endorsement satisfies it
                !tx.attestations.iter().any(|r| {
                    r.name == request.name
                        && r.attestation_type() == pb::AttestationType::Endorse
                })
            })
            .cloned()
            .collect();

        for request in outstanding {
            for party in &request.parties {
                let (_, verifier) = self
                    .inner
                    .keys
                    .resolve_key(party, &request.algorithm)
                    .await?;
                let endorser = pb::ResolvedVerifier {
                    lookup: party.clone(),
                    algorithm: request.algorithm.clone(),
                    verifier_type: request.verifier_type.clone(),
                    verifier,
                };
                match domain.endorse_transaction(tx, &request, &endorser).await? {
                    EndorseOutcome::Submit { payload } => {
                        debug!(endorsement = %request.name, "endorser authorized submission");
                        tx.attestations.push(pb::AttestationResult {
                            name: request.name.clone(),
                            attestation_type: pb::AttestationType::Endorse as i32,
                            verifier: Some(endorser),
                            payload,
                        });
                    }
                    EndorseOutcome::Sign { payload } => {
                        // The endorser wants a signature first; collect it
                        // and come back through Endorse with it in hand
                        let (key_handle, _) = self
                            .inner
                            .keys
                            .resolve_key(party, &request.algorithm)
                            .await?;
                        let response = self
                            .inner
                            .keys
                            .sign(paladin_keys::SignRequest {
                                key_handle,
                                algorithm: request.algorithm.clone(),
                                payload_type: paladin_keys::algorithms::PAYLOAD_OPAQUE_RSV
                                    .to_string(),
                                payload,
                            })
                            .await?;
                        tx.attestations.push(pb::AttestationResult {
                            name: request.name.clone(),
                            attestation_type: pb::AttestationType::Sign as i32,
                            verifier: Some(endorser),
                            payload: response.signature,
                        });
                        return Ok(StageOutcome::NewAction);
                    }
                    EndorseOutcome::Revert(reason) => {
                        return Err(EngineError::Revert(reason));
                    }
                }
            }
        }
        Ok(StageOutcome::NewStage(TxStage::Prepare))
    }

    async fn stage_prepare(
        &self,
        domain: &Arc<Domain>,
        tx: &mut PrivateTransaction,
    ) -> Result<StageOutcome> {
        if tx.contract.is_some() {
            domain.prepare_transaction(tx).await?;
        } else {
            domain.prepare_deploy(tx).await?;
        }
        Ok(StageOutcome::NewStage(TxStage::Dispatch))
    }

    async fn stage_dispatch(
        &self,
        tx: &mut PrivateTransaction,
        waiter: &mut Option<InflightWaiter>,
    ) -> Result<StageOutcome> {
        let prepared = tx.prepared.as_ref().ok_or_else(|| EngineError::TxIncomplete {
            tx: tx.id,
            detail: "nothing prepared to dispatch".into(),
        })?;
        // Register the waiter before submission so a fast confirmation
        // cannot slip between dispatch and await
        *waiter = Some(self.inner.manager.waiters().register(tx.id));
        let hash = self.inner.submitter.submit(tx.id, prepared).await?;
        info!(base_ledger_tx = %hash, signer = %prepared.signer, "dispatched to base ledger");
        Ok(StageOutcome::NewStage(TxStage::AwaitConfirm))
    }

    async fn stage_await_confirm(
        &self,
        tx: &mut PrivateTransaction,
        waiter: &mut Option<InflightWaiter>,
    ) -> Result<StageOutcome> {
        let inflight = waiter.take().ok_or_else(|| EngineError::TxIncomplete {
            tx: tx.id,
            detail: "no waiter registered".into(),
        })?;
        inflight.wait(&self.inner.cancel).await?;
        // Completion is held back until every pre-req completed
        self.inner
            .dependencies
            .wait_for_pre_reqs(&tx.pre_reqs, TxStage::Complete, &self.inner.cancel)
            .await?;
        Ok(StageOutcome::NewStage(TxStage::Complete))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TERMINALS
    // ═══════════════════════════════════════════════════════════════════════

    async fn finish_reverted(
        &self,
        tx: &mut PrivateTransaction,
        reason: String,
    ) -> Result<TxOutcome> {
        warn!(tx = %tx.id, %reason, "transaction reverted");
        self.inner.dependencies.mark_stage(tx.id, TxStage::Reverted);
        self.inner
            .finalizer
            .finalize_failure(tx.id, reason.clone())
            .await?;
        Ok(TxOutcome::Reverted(reason))
    }

    async fn finish_failed(
        &self,
        tx: &mut PrivateTransaction,
        message: String,
    ) -> Result<TxOutcome> {
        warn!(tx = %tx.id, %message, "transaction failed");
        self.inner.dependencies.mark_stage(tx.id, TxStage::Failed);
        self.inner
            .finalizer
            .finalize_failure(tx.id, message.clone())
            .await?;
        Ok(TxOutcome::Failed(message))
    }
}
