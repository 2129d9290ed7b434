//! Per-stage status transitions and progress tracking.
//!
//! [`StageStateMachine`] owns every mutation of [`StageExecution`] records.
//! Transitions are `pending → running → {completed | failed | skipped}`,
//! with `failed → running` permitted only as retry re-entry. Status writes
//! degrade gracefully when the persistence layer is unavailable: the
//! pipeline run is more valuable than a single status update.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::{StageExecution, StageStatus};
use crate::store::{StateStore, StoreError};

/// Re-entry was requested for a failed stage whose retry budget is spent.
#[derive(Debug, Clone, Error)]
#[error("retry limit reached for ({document_id}, {stage_name}): {max_retries} retries")]
pub struct RetryLimitReached {
    /// The document.
    pub document_id: String,
    /// The stage.
    pub stage_name: String,
    /// The exhausted budget.
    pub max_retries: u32,
}

/// Persisted state machine for (document, stage) executions.
pub struct StageStateMachine {
    store: Arc<dyn StateStore>,
}

impl StageStateMachine {
    /// Creates a state machine over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Transitions a stage to `running`.
    ///
    /// A missing or `pending` record starts fresh. A `failed` record
    /// re-enters as a retry and increments `retry_count`, bounded by
    /// `max_retries`. A `completed` or `skipped` record re-enters as
    /// reprocessing with a reset retry budget; callers only take that path
    /// after invalidating the stage's completion marker. A `running`
    /// record is re-entered in place: the advisory lock serializes live
    /// holders, so a running row without a holder is the residue of a
    /// process that died mid-stage.
    ///
    /// `max_retries` is only applied when the record is first created.
    pub async fn start(
        &self,
        document_id: &str,
        stage_name: &str,
        max_retries: u32,
    ) -> Result<StageExecution, RetryLimitReached> {
        let mut execution = self
            .read(document_id, stage_name)
            .await
            .unwrap_or_else(|| StageExecution::new(document_id, stage_name, max_retries));

        match execution.status {
            StageStatus::Pending => {}
            StageStatus::Running => {
                debug!(
                    document_id,
                    stage = stage_name,
                    "re-entering a running stage record"
                );
            }
            StageStatus::Failed => {
                if !execution.retries_remaining() {
                    return Err(RetryLimitReached {
                        document_id: document_id.to_string(),
                        stage_name: stage_name.to_string(),
                        max_retries: execution.max_retries,
                    });
                }
                execution.retry_count += 1;
            }
            StageStatus::Completed | StageStatus::Skipped => {
                debug!(
                    document_id,
                    stage = stage_name,
                    "reprocessing a finished stage with fresh inputs"
                );
                execution.retry_count = 0;
            }
        }

        execution.status = StageStatus::Running;
        execution.progress = 0;
        execution.error_message = None;
        execution.started_at = Some(Utc::now());
        execution.completed_at = None;

        self.persist(&execution).await;
        Ok(execution)
    }

    /// Updates progress, clamped to 0–100. No-op if the record is missing.
    pub async fn update_progress(&self, document_id: &str, stage_name: &str, progress: u8) {
        let Some(mut execution) = self.read(document_id, stage_name).await else {
            warn!(
                document_id,
                stage = stage_name,
                "progress update for unknown stage record"
            );
            return;
        };
        execution.progress = progress.min(100);
        self.persist(&execution).await;
    }

    /// Marks the stage completed.
    pub async fn complete(
        &self,
        document_id: &str,
        stage_name: &str,
        metadata: Option<&serde_json::Value>,
    ) {
        let mut execution = self
            .read(document_id, stage_name)
            .await
            .unwrap_or_else(|| StageExecution::new(document_id, stage_name, 0));
        execution.status = StageStatus::Completed;
        execution.progress = 100;
        execution.completed_at = Some(Utc::now());
        execution.error_message = None;
        self.persist(&execution).await;

        debug!(
            document_id,
            stage = stage_name,
            metadata = metadata.map(ToString::to_string).as_deref(),
            "stage completed"
        );
    }

    /// Marks the stage failed with a message.
    pub async fn fail(&self, document_id: &str, stage_name: &str, message: &str) {
        let mut execution = self
            .read(document_id, stage_name)
            .await
            .unwrap_or_else(|| StageExecution::new(document_id, stage_name, 0));
        execution.status = StageStatus::Failed;
        execution.completed_at = Some(Utc::now());
        execution.error_message = Some(message.to_string());
        self.persist(&execution).await;
    }

    /// Marks the stage skipped.
    pub async fn skip(&self, document_id: &str, stage_name: &str, reason: &str) {
        let mut execution = self
            .read(document_id, stage_name)
            .await
            .unwrap_or_else(|| StageExecution::new(document_id, stage_name, 0));
        execution.status = StageStatus::Skipped;
        execution.progress = 100;
        execution.completed_at = Some(Utc::now());
        execution.error_message = None;
        self.persist(&execution).await;

        debug!(document_id, stage = stage_name, reason, "stage skipped");
    }

    /// Fetches the execution record for a (document, stage) pair.
    pub async fn status(
        &self,
        document_id: &str,
        stage_name: &str,
    ) -> Result<Option<StageExecution>, StoreError> {
        self.store.get(document_id, stage_name).await
    }

    /// Lists all execution records for a document.
    pub async fn statuses_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<StageExecution>, StoreError> {
        self.store.list_for_document(document_id).await
    }

    async fn read(&self, document_id: &str, stage_name: &str) -> Option<StageExecution> {
        match self.store.get(document_id, stage_name).await {
            Ok(execution) => execution,
            Err(e) => {
                warn!(
                    document_id,
                    stage = stage_name,
                    error = %e,
                    "state read failed, treating record as absent"
                );
                None
            }
        }
    }

    async fn persist(&self, execution: &StageExecution) {
        if let Err(e) = self.store.upsert(execution.clone()).await {
            warn!(
                document_id = %execution.document_id,
                stage = %execution.stage_name,
                status = %execution.status,
                error = %e,
                "state write failed, continuing"
            );
        }
    }
}
