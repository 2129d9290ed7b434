//! The retry decision and execution loop.
//!
//! [`RetryOrchestrator`] composes the classifier, policy manager, lock
//! manager, idempotency checker, error logger, and state machine into a
//! single path that decides, for each failed attempt, whether to retry,
//! escalate, or give up.
//!
//! The first retry executes inline on the caller's path after the computed
//! backoff; subsequent retries run as detached tasks whose terminal
//! outcome is recorded in the persisted execution and error records and
//! surfaced through the returned join handle.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::backoff;
use super::classifier::ErrorClassifier;
use super::error_log::{ErrorLogger, FailureReport};
use super::lock::{AdvisoryLockManager, LockGuard};
use super::policy::RetryPolicyManager;
use crate::cancellation::CancelToken;
use crate::core::{ErrorStatus, FaultCategory, StageExecution};
use crate::errors::StageFault;
use crate::idempotency::IdempotencyChecker;
use crate::pipeline::context::{spawning_progress_sink, DocumentContext, StageContext};
use crate::pipeline::processor::{invoke, StageDefinition};
use crate::state::StageStateMachine;
use crate::utils::correlation::correlation_id;

/// Outcome of delegating a failed attempt to the retry orchestrator.
#[derive(Debug)]
pub enum RetryOutcome {
    /// The inline retry succeeded; the stage is completed.
    Recovered {
        /// The artifact the retried attempt produced.
        artifact: serde_json::Value,
    },
    /// Retries continue as detached background work.
    Scheduled {
        /// Correlation ID of the next scheduled attempt.
        correlation_id: String,
        /// Resolves with the terminal outcome of the background chain.
        handle: JoinHandle<RetryTerminal>,
    },
    /// Another execution holds the (document, stage) advisory lock.
    AlreadyInProgress,
    /// The fault was permanent; the stage failed without retrying.
    Failed {
        /// The durable error record, when the store accepted the write.
        error_id: Option<Uuid>,
    },
    /// The retry budget is spent; the stage failed terminally.
    Exhausted {
        /// The durable error record, when the store accepted the write.
        error_id: Option<Uuid>,
    },
}

/// Terminal outcome of a detached retry chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTerminal {
    /// A retry attempt eventually succeeded.
    Completed,
    /// A retry attempt failed permanently.
    Failed,
    /// The retry budget was exhausted.
    Exhausted,
    /// The run was cancelled mid-chain.
    Cancelled,
}

/// A failed attempt: the execution record as of the failure plus the fault.
#[derive(Debug)]
pub struct AttemptFailure {
    /// The execution record after the failed attempt started.
    pub execution: StageExecution,
    /// The fault the attempt raised.
    pub fault: StageFault,
}

enum Assessment {
    Permanent { error_id: Option<Uuid> },
    Exhausted { error_id: Option<Uuid> },
    Retry { delay: Duration, error_id: Option<Uuid> },
}

/// Composes the resilience leaves into the retry decision loop.
#[derive(Clone)]
pub struct RetryOrchestrator {
    classifier: ErrorClassifier,
    policies: Arc<RetryPolicyManager>,
    locks: Arc<AdvisoryLockManager>,
    idempotency: Arc<IdempotencyChecker>,
    errors: Arc<ErrorLogger>,
    state: Arc<StageStateMachine>,
    default_timeout: Duration,
}

impl RetryOrchestrator {
    /// Wires the orchestrator to its collaborators.
    #[must_use]
    pub fn new(
        policies: Arc<RetryPolicyManager>,
        locks: Arc<AdvisoryLockManager>,
        idempotency: Arc<IdempotencyChecker>,
        errors: Arc<ErrorLogger>,
        state: Arc<StageStateMachine>,
    ) -> Self {
        Self {
            classifier: ErrorClassifier::new(),
            policies,
            locks,
            idempotency,
            errors,
            state,
            default_timeout: Duration::from_secs(300),
        }
    }

    /// Sets the timeout applied to attempts without a per-stage override.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Handles a failed attempt end to end.
    ///
    /// `execution` must be the record of the attempt that raised `fault`;
    /// its `retry_count` selects the correlation suffix and backoff slot.
    pub async fn handle_failure(
        &self,
        document: Arc<DocumentContext>,
        stage: &StageDefinition,
        execution: &StageExecution,
        fault: StageFault,
        cancel: CancelToken,
    ) -> RetryOutcome {
        match self.assess(&document, stage, execution, &fault).await {
            Assessment::Permanent { error_id } => RetryOutcome::Failed { error_id },
            Assessment::Exhausted { error_id } => RetryOutcome::Exhausted { error_id },
            Assessment::Retry { delay, error_id } => {
                let Some(guard) = self.locks.try_acquire(&document.document_id, &stage.name)
                else {
                    info!(
                        document_id = %document.document_id,
                        stage = %stage.name,
                        "retry already in progress"
                    );
                    return RetryOutcome::AlreadyInProgress;
                };

                if execution.retry_count == 0 {
                    self.inline_then_background(document, stage, delay, error_id, guard, cancel)
                        .await
                } else {
                    let correlation = correlation_id(
                        &document.request_id,
                        &stage.name,
                        execution.retry_count + 1,
                    );
                    let handle =
                        self.spawn_background(document, stage.clone(), delay, error_id, guard, cancel);
                    RetryOutcome::Scheduled {
                        correlation_id: correlation,
                        handle,
                    }
                }
            }
        }
    }

    /// Runs one attempt of a stage: transition to running, invoke the
    /// processor, and record success. The caller must hold the advisory
    /// lock for the (document, stage) pair.
    ///
    /// `max_retries_on_create` sizes the retry budget when the execution
    /// record does not exist yet; an existing record keeps its budget.
    pub(crate) async fn attempt(
        &self,
        document: &Arc<DocumentContext>,
        stage: &StageDefinition,
        max_retries_on_create: u32,
        cancel: &CancelToken,
    ) -> Result<serde_json::Value, AttemptFailure> {
        let execution = match self
            .state
            .start(&document.document_id, &stage.name, max_retries_on_create)
            .await
        {
            Ok(execution) => execution,
            Err(e) => {
                let execution = self
                    .state
                    .status(&document.document_id, &stage.name)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| {
                        StageExecution::new(&document.document_id, &stage.name, 0)
                    });
                return Err(AttemptFailure {
                    execution,
                    fault: StageFault::other("StateError", e.to_string()),
                });
            }
        };

        let ctx = StageContext::new(document.clone(), &stage.name, execution.retry_count)
            .with_progress_sink(spawning_progress_sink(
                self.state.clone(),
                document.document_id.clone(),
                stage.name.clone(),
            ));

        match invoke(stage, &ctx, self.default_timeout, cancel).await {
            Ok(artifact) => {
                self.record_success(document, stage, &artifact).await;
                Ok(artifact)
            }
            Err(fault) => Err(AttemptFailure { execution, fault }),
        }
    }

    /// Success bookkeeping shared by primary and retry attempts: record the
    /// artifact, upsert the completion marker, and complete the stage.
    pub(crate) async fn record_success(
        &self,
        document: &DocumentContext,
        stage: &StageDefinition,
        artifact: &serde_json::Value,
    ) {
        document.record_artifact(&stage.name, artifact.clone());

        let hash = document.fingerprint_for(&stage.name).hash();
        if let Err(e) = self
            .idempotency
            .set(&document.document_id, &stage.name, &hash, artifact.clone())
            .await
        {
            warn!(
                document_id = %document.document_id,
                stage = %stage.name,
                error = %e,
                "completion marker write failed"
            );
        }

        self.state
            .complete(&document.document_id, &stage.name, Some(artifact))
            .await;
    }

    /// Classifies and records one failure, deciding what happens next.
    async fn assess(
        &self,
        document: &DocumentContext,
        stage: &StageDefinition,
        execution: &StageExecution,
        fault: &StageFault,
    ) -> Assessment {
        let category = self.classifier.classify(fault);
        let correlation =
            correlation_id(&document.request_id, &stage.name, execution.retry_count);

        let mut extra_context = HashMap::new();
        extra_context.insert("request_id".to_string(), document.request_id.clone());
        extra_context.insert("service".to_string(), stage.service.clone());

        let error_id = match self
            .errors
            .log(FailureReport {
                document_id: &document.document_id,
                stage_name: &stage.name,
                fault,
                category,
                correlation_id: &correlation,
                retry_count: execution.retry_count,
                max_retries: execution.max_retries,
                extra_context,
            })
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    correlation_id = %correlation,
                    error = %e,
                    "error record write failed"
                );
                None
            }
        };

        if category == FaultCategory::Permanent {
            self.state
                .fail(&document.document_id, &stage.name, &fault.message)
                .await;
            if let Some(id) = error_id {
                self.close_record(id, None).await;
            }
            return Assessment::Permanent { error_id };
        }

        if !execution.retries_remaining() {
            self.state
                .fail(&document.document_id, &stage.name, &fault.message)
                .await;
            if let Some(id) = error_id {
                self.close_record(id, Some("retry limit exceeded")).await;
            }
            return Assessment::Exhausted { error_id };
        }

        let policy = self.policies.resolve(&stage.service, Some(&stage.name)).await;
        let delay = backoff::retry_delay(&policy, execution.retry_count);

        self.state
            .fail(&document.document_id, &stage.name, &fault.message)
            .await;
        if let Some(id) = error_id {
            let due = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            if let Err(e) = self
                .errors
                .schedule_retry(id, execution.retry_count + 1, due)
                .await
            {
                warn!(error_id = %id, error = %e, "retry scheduling update failed");
            }
        }

        Assessment::Retry { delay, error_id }
    }

    async fn inline_then_background(
        &self,
        document: Arc<DocumentContext>,
        stage: &StageDefinition,
        delay: Duration,
        error_id: Option<Uuid>,
        guard: LockGuard,
        cancel: CancelToken,
    ) -> RetryOutcome {
        if !cancel.sleep(delay).await {
            self.state
                .fail(&document.document_id, &stage.name, "cancelled before retry")
                .await;
            drop(guard);
            return RetryOutcome::Failed { error_id };
        }

        match self.attempt(&document, stage, 0, &cancel).await {
            Ok(artifact) => {
                if let Some(id) = error_id {
                    self.resolve_record(id).await;
                }
                drop(guard);
                RetryOutcome::Recovered { artifact }
            }
            Err(AttemptFailure { execution, fault }) => {
                match self.assess(&document, stage, &execution, &fault).await {
                    Assessment::Permanent { error_id } => {
                        drop(guard);
                        RetryOutcome::Failed { error_id }
                    }
                    Assessment::Exhausted { error_id } => {
                        drop(guard);
                        RetryOutcome::Exhausted { error_id }
                    }
                    Assessment::Retry { delay, error_id } => {
                        let correlation = correlation_id(
                            &document.request_id,
                            &stage.name,
                            execution.retry_count + 1,
                        );
                        let handle = self.spawn_background(
                            document,
                            stage.clone(),
                            delay,
                            error_id,
                            guard,
                            cancel,
                        );
                        RetryOutcome::Scheduled {
                            correlation_id: correlation,
                            handle,
                        }
                    }
                }
            }
        }
    }

    /// Spawns the detached retry chain. The advisory lock guard moves into
    /// the task and is released when the chain reaches a terminal state,
    /// whatever that state is.
    fn spawn_background(
        &self,
        document: Arc<DocumentContext>,
        stage: StageDefinition,
        first_delay: Duration,
        first_error_id: Option<Uuid>,
        guard: LockGuard,
        cancel: CancelToken,
    ) -> JoinHandle<RetryTerminal> {
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let mut delay = first_delay;
            let mut last_error_id = first_error_id;

            loop {
                if !cancel.sleep(delay).await {
                    this.state
                        .fail(&document.document_id, &stage.name, "cancelled before retry")
                        .await;
                    return RetryTerminal::Cancelled;
                }

                match this.attempt(&document, &stage, 0, &cancel).await {
                    Ok(_) => {
                        if let Some(id) = last_error_id {
                            this.resolve_record(id).await;
                        }
                        return RetryTerminal::Completed;
                    }
                    Err(AttemptFailure { execution, fault }) => {
                        match this.assess(&document, &stage, &execution, &fault).await {
                            Assessment::Permanent { .. } => return RetryTerminal::Failed,
                            Assessment::Exhausted { .. } => return RetryTerminal::Exhausted,
                            Assessment::Retry {
                                delay: next,
                                error_id,
                            } => {
                                delay = next;
                                last_error_id = error_id;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn resolve_record(&self, error_id: Uuid) {
        if let Err(e) = self
            .errors
            .update_status(error_id, ErrorStatus::Resolved, Some("recovered on retry"))
            .await
        {
            warn!(error_id = %error_id, error = %e, "error record resolution failed");
        }
    }

    async fn close_record(&self, error_id: Uuid, notes: Option<&str>) {
        if let Err(e) = self
            .errors
            .update_status(error_id, ErrorStatus::Failed, notes)
            .await
        {
            warn!(error_id = %error_id, error = %e, "error record close failed");
        }
    }
}
