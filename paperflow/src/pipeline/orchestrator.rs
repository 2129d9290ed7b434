//! Drives the full stage sequence for a document.
//!
//! For each stage in the configured sequence the orchestrator checks the
//! idempotency marker, runs the processor under the advisory lock, and on
//! failure delegates to the retry orchestrator. Faults never escape this
//! boundary: every fault becomes a durable error record plus a structured
//! log event, and the per-document result is an aggregated
//! [`DocumentOutcome`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use super::context::DocumentContext;
use super::processor::StageDefinition;
use crate::cancellation::CancelToken;
use crate::core::{DocumentStatus, ErrorRecord, RetryPolicy, StageExecution};
use crate::idempotency::IdempotencyChecker;
use crate::resilience::{
    AdvisoryLockManager, ErrorLogger, RetryOrchestrator, RetryOutcome, RetryTerminal,
    RetryPolicyManager,
};
use crate::state::StageStateMachine;
use crate::store::{
    InMemoryErrorStore, InMemoryMarkerStore, InMemoryPolicyStore, InMemoryStateStore, StoreError,
};

/// How stage failures aggregate into a document outcome.
///
/// Best-effort exists for bulk backfills where partial extraction is still
/// useful; it is an explicit, named choice rather than a hidden default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// The document completes only if every stage succeeded; a terminal
    /// stage failure halts the sequence.
    #[default]
    Strict,
    /// Remaining stages still run after a failure; the document completes
    /// once at least one stage succeeded, with the rest recorded as failed
    /// for later reprocessing.
    BestEffort,
}

/// Pipeline-wide configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How failures aggregate into the document outcome.
    pub completion_policy: CompletionPolicy,
    /// Timeout applied to stages without a per-stage override.
    pub stage_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            completion_policy: CompletionPolicy::default(),
            stage_timeout: Duration::from_secs(300),
        }
    }
}

/// Terminal-ish disposition of one stage within a document run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageDisposition {
    /// The stage produced its artifact during this run.
    Completed,
    /// A valid completion marker covered the stage; the processor was not
    /// invoked.
    Skipped,
    /// A detached retry chain is still in flight.
    Retrying {
        /// Correlation ID of the next scheduled attempt.
        correlation_id: String,
    },
    /// Another execution holds the (document, stage) lock.
    AlreadyInProgress,
    /// The stage failed terminally.
    Failed {
        /// The durable error record, when one was written.
        error_id: Option<Uuid>,
    },
    /// The stage was not attempted (halted sequence or cancellation).
    NotAttempted,
}

impl StageDisposition {
    /// Returns true if the stage's output is available.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Returns true while the stage could still complete in this run.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Retrying { .. } | Self::AlreadyInProgress)
    }
}

/// One stage's result within a document run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    /// The stage name.
    pub stage_name: String,
    /// What happened.
    pub disposition: StageDisposition,
}

/// A detached retry chain left running by a document run.
#[derive(Debug)]
pub struct PendingRetry {
    /// The stage being retried.
    pub stage_name: String,
    /// Correlation ID of the next scheduled attempt.
    pub correlation_id: String,
    /// Resolves with the chain's terminal outcome.
    pub handle: JoinHandle<RetryTerminal>,
}

/// Aggregated result of one document run.
#[derive(Debug)]
pub struct DocumentOutcome {
    /// The document.
    pub document_id: String,
    /// Aggregated status under the configured completion policy.
    pub status: DocumentStatus,
    /// Per-stage results in sequence order.
    pub stages: Vec<StageResult>,
    /// Detached retry chains still in flight when the run returned.
    pub pending_retries: Vec<PendingRetry>,
}

impl DocumentOutcome {
    /// Awaits every detached retry chain, returning each stage's terminal
    /// outcome. The persisted records are authoritative; this is a
    /// convenience for callers that want to block on full settlement.
    pub async fn wait_for_retries(&mut self) -> Vec<(String, RetryTerminal)> {
        let (names, handles): (Vec<_>, Vec<_>) = self
            .pending_retries
            .drain(..)
            .map(|p| (p.stage_name, p.handle))
            .unzip();

        names
            .into_iter()
            .zip(futures::future::join_all(handles).await)
            .map(|(name, result)| (name, result.unwrap_or(RetryTerminal::Failed)))
            .collect()
    }
}

/// The persistence-facing collaborators of a pipeline, bundled.
#[derive(Clone)]
pub struct PipelineServices {
    /// Stage state machine.
    pub state: Arc<StageStateMachine>,
    /// Completion marker checker.
    pub idempotency: Arc<IdempotencyChecker>,
    /// Retry policy cache.
    pub policies: Arc<RetryPolicyManager>,
    /// Advisory lock manager.
    pub locks: Arc<AdvisoryLockManager>,
    /// Durable error logger.
    pub errors: Arc<ErrorLogger>,
}

impl PipelineServices {
    /// Builds a fully in-memory service set with seeded retry policies.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(StageStateMachine::new(Arc::new(InMemoryStateStore::new()))),
            idempotency: Arc::new(IdempotencyChecker::new(Arc::new(
                InMemoryMarkerStore::new(),
            ))),
            policies: Arc::new(RetryPolicyManager::new(Arc::new(
                InMemoryPolicyStore::seeded(),
            ))),
            locks: Arc::new(AdvisoryLockManager::in_process()),
            errors: Arc::new(ErrorLogger::new(Arc::new(InMemoryErrorStore::new()))),
        }
    }
}

/// Drives documents through the configured stage sequence.
pub struct PipelineOrchestrator {
    stages: Vec<StageDefinition>,
    services: PipelineServices,
    retry: Arc<RetryOrchestrator>,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator over the given stages and services.
    #[must_use]
    pub fn new(
        stages: Vec<StageDefinition>,
        services: PipelineServices,
        config: PipelineConfig,
    ) -> Self {
        let retry = Arc::new(
            RetryOrchestrator::new(
                services.policies.clone(),
                services.locks.clone(),
                services.idempotency.clone(),
                services.errors.clone(),
                services.state.clone(),
            )
            .with_default_timeout(config.stage_timeout),
        );
        Self {
            stages,
            services,
            retry,
            config,
        }
    }

    /// The configured stage sequence.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Runs every stage of the sequence for one document.
    pub async fn run_document(
        &self,
        document: Arc<DocumentContext>,
        cancel: &CancelToken,
    ) -> DocumentOutcome {
        let mut results = Vec::with_capacity(self.stages.len());
        let mut pending = Vec::new();
        let mut halted = false;

        for stage in &self.stages {
            if halted || cancel.is_cancelled() {
                results.push(StageResult {
                    stage_name: stage.name.clone(),
                    disposition: StageDisposition::NotAttempted,
                });
                continue;
            }

            let disposition = self
                .execute_stage(&document, stage, cancel, &mut pending)
                .await;

            if self.config.completion_policy == CompletionPolicy::Strict
                && !disposition.is_success()
            {
                halted = true;
            }

            results.push(StageResult {
                stage_name: stage.name.clone(),
                disposition,
            });
        }

        let status = aggregate_status(self.config.completion_policy, &results);
        DocumentOutcome {
            document_id: document.document_id.clone(),
            status,
            stages: results,
            pending_retries: pending,
        }
    }

    /// Targeted re-run of a single stage, honoring completion markers of
    /// the other stages. Returns `None` if the stage is not configured.
    pub async fn run_stage(
        &self,
        document: Arc<DocumentContext>,
        stage_name: &str,
        cancel: &CancelToken,
    ) -> Option<DocumentOutcome> {
        let stage = self.stages.iter().find(|s| s.name == stage_name)?.clone();

        self.hydrate_artifacts(&document).await;

        let mut pending = Vec::new();
        let disposition = self
            .execute_stage(&document, &stage, cancel, &mut pending)
            .await;

        let results = vec![StageResult {
            stage_name: stage.name.clone(),
            disposition,
        }];
        let status = aggregate_status(self.config.completion_policy, &results);

        Some(DocumentOutcome {
            document_id: document.document_id.clone(),
            status,
            stages: results,
            pending_retries: pending,
        })
    }

    /// Per-stage status of a document, for operator tooling.
    pub async fn stage_statuses(
        &self,
        document_id: &str,
    ) -> Result<Vec<StageExecution>, StoreError> {
        self.services.state.statuses_for_document(document_id).await
    }

    /// Full error history of a document, for operator tooling.
    pub async fn error_history(&self, document_id: &str) -> Result<Vec<ErrorRecord>, StoreError> {
        self.services.errors.history(document_id).await
    }

    /// Manually resolves an error record with notes.
    pub async fn resolve_error(
        &self,
        error_id: Uuid,
        resolved_by: &str,
        notes: &str,
    ) -> Result<(), StoreError> {
        self.services
            .errors
            .mark_resolved(error_id, resolved_by, notes)
            .await
    }

    async fn execute_stage(
        &self,
        document: &Arc<DocumentContext>,
        stage: &StageDefinition,
        cancel: &CancelToken,
        pending: &mut Vec<PendingRetry>,
    ) -> StageDisposition {
        let hash = document.fingerprint_for(&stage.name).hash();

        match self
            .services
            .idempotency
            .check(&document.document_id, &stage.name)
            .await
        {
            Ok(Some(marker)) if marker.matches(&hash) => {
                document.record_artifact(&stage.name, marker.metadata.clone());
                self.services
                    .state
                    .skip(
                        &document.document_id,
                        &stage.name,
                        "completion marker covers current inputs",
                    )
                    .await;
                return StageDisposition::Skipped;
            }
            Ok(Some(_)) => {
                // Inputs changed; the stale marker must go before the re-run.
                if let Err(e) = self
                    .services
                    .idempotency
                    .invalidate(&document.document_id, &stage.name)
                    .await
                {
                    warn!(
                        document_id = %document.document_id,
                        stage = %stage.name,
                        error = %e,
                        "stale marker invalidation failed"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    document_id = %document.document_id,
                    stage = %stage.name,
                    error = %e,
                    "idempotency check failed, running the stage"
                );
            }
        }

        let policy: RetryPolicy = self
            .services
            .policies
            .resolve(&stage.service, Some(&stage.name))
            .await;

        let Some(guard) = self
            .services
            .locks
            .try_acquire(&document.document_id, &stage.name)
        else {
            return StageDisposition::AlreadyInProgress;
        };

        let failure = match self
            .retry
            .attempt(document, stage, policy.max_retries, cancel)
            .await
        {
            Ok(_) => {
                drop(guard);
                return StageDisposition::Completed;
            }
            Err(failure) => failure,
        };

        // Release before delegating; the retry orchestrator re-acquires for
        // the retry chain it may start.
        drop(guard);

        let outcome = self
            .retry
            .handle_failure(
                document.clone(),
                stage,
                &failure.execution,
                failure.fault,
                cancel.clone(),
            )
            .await;

        match outcome {
            RetryOutcome::Recovered { .. } => StageDisposition::Completed,
            RetryOutcome::Scheduled {
                correlation_id,
                handle,
            } => {
                pending.push(PendingRetry {
                    stage_name: stage.name.clone(),
                    correlation_id: correlation_id.clone(),
                    handle,
                });
                StageDisposition::Retrying { correlation_id }
            }
            RetryOutcome::AlreadyInProgress => StageDisposition::AlreadyInProgress,
            RetryOutcome::Failed { error_id } | RetryOutcome::Exhausted { error_id } => {
                StageDisposition::Failed { error_id }
            }
        }
    }

    /// Rehydrates artifacts from existing completion markers so a targeted
    /// re-run sees its upstream inputs.
    async fn hydrate_artifacts(&self, document: &Arc<DocumentContext>) {
        for stage in &self.stages {
            if document.artifact(&stage.name).is_some() {
                continue;
            }
            match self
                .services
                .idempotency
                .check(&document.document_id, &stage.name)
                .await
            {
                Ok(Some(marker)) => {
                    document.record_artifact(&stage.name, marker.metadata.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        document_id = %document.document_id,
                        stage = %stage.name,
                        error = %e,
                        "artifact rehydration failed"
                    );
                }
            }
        }
    }
}

fn aggregate_status(policy: CompletionPolicy, results: &[StageResult]) -> DocumentStatus {
    let successes = results
        .iter()
        .filter(|r| r.disposition.is_success())
        .count();
    let any_failed = results
        .iter()
        .any(|r| matches!(r.disposition, StageDisposition::Failed { .. }));
    let any_in_flight = results.iter().any(|r| r.disposition.is_in_flight());

    match policy {
        CompletionPolicy::Strict => {
            if any_failed {
                DocumentStatus::Failed
            } else if any_in_flight {
                DocumentStatus::Processing
            } else if successes == results.len() && !results.is_empty() {
                DocumentStatus::Completed
            } else if successes == 0 && results.is_empty() {
                DocumentStatus::Pending
            } else {
                // Not attempted without a failure: cancelled mid-sequence.
                DocumentStatus::Failed
            }
        }
        CompletionPolicy::BestEffort => {
            if successes > 0 {
                DocumentStatus::Completed
            } else if any_in_flight {
                DocumentStatus::Processing
            } else if results.is_empty() {
                DocumentStatus::Pending
            } else {
                DocumentStatus::Failed
            }
        }
    }
}
