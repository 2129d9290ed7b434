//! Durable error logging with correlated structured events.
//!
//! Every failure produces exactly one [`ErrorRecord`] row and one tracing
//! event, both carrying the same correlation ID so they can be joined
//! later. Records are append-only; after creation only the status fields
//! mutate.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::core::{ErrorRecord, ErrorStatus, FaultCategory};
use crate::errors::StageFault;
use crate::store::{ErrorStore, StoreError};
use crate::utils::sanitize::sanitize_context;

/// Everything known about one failure at logging time.
#[derive(Debug)]
pub struct FailureReport<'a> {
    /// The document whose stage failed.
    pub document_id: &'a str,
    /// The stage that failed.
    pub stage_name: &'a str,
    /// The fault raised by the processor.
    pub fault: &'a StageFault,
    /// Category assigned by the classifier.
    pub category: FaultCategory,
    /// Correlation ID of the failed attempt.
    pub correlation_id: &'a str,
    /// Retry count at failure time.
    pub retry_count: u32,
    /// Retry budget in effect.
    pub max_retries: u32,
    /// Call-site context merged on top of the fault's own context.
    pub extra_context: HashMap<String, String>,
}

/// Writes durable error records and their paired log events.
pub struct ErrorLogger {
    store: Arc<dyn ErrorStore>,
}

impl ErrorLogger {
    /// Creates a logger over the given error store.
    #[must_use]
    pub fn new(store: Arc<dyn ErrorStore>) -> Self {
        Self { store }
    }

    /// Records a failure: one durable row plus one structured event.
    ///
    /// Returns the generated error ID.
    pub async fn log(&self, report: FailureReport<'_>) -> Result<Uuid, StoreError> {
        let error_id = Uuid::new_v4();

        let mut context = report.fault.context_chain();
        context.extend(report.extra_context.clone());
        let context = sanitize_context(&context);

        let record = ErrorRecord {
            error_id,
            document_id: report.document_id.to_string(),
            stage_name: report.stage_name.to_string(),
            error_type: report.fault.kind.label(),
            error_category: report.category,
            message: report.fault.message.clone(),
            stack_trace: Some(report.fault.render_chain()),
            context,
            retry_count: report.retry_count,
            max_retries: report.max_retries,
            status: ErrorStatus::Open,
            correlation_id: report.correlation_id.to_string(),
            next_retry_at: None,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            created_at: Utc::now(),
        };

        self.store.insert(record).await?;

        error!(
            correlation_id = report.correlation_id,
            error_id = %error_id,
            document_id = report.document_id,
            stage = report.stage_name,
            error_type = %report.fault.kind,
            category = %report.category,
            retry_count = report.retry_count,
            max_retries = report.max_retries,
            "stage failed: {}",
            report.fault.message
        );

        Ok(error_id)
    }

    /// Updates the record's status, optionally attaching resolution notes.
    pub async fn update_status(
        &self,
        error_id: Uuid,
        status: ErrorStatus,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut record = self.fetch(error_id).await?;
        record.status = status;
        if let Some(notes) = notes {
            record.resolution_notes = Some(notes.to_string());
        }
        if status == ErrorStatus::Resolved && record.resolved_at.is_none() {
            record.resolved_at = Some(Utc::now());
            record.resolved_by.get_or_insert_with(|| "retry".to_string());
        }
        self.store.update(record).await
    }

    /// Marks retry progression: the record moves to `retrying` with the
    /// upcoming retry count and due time.
    pub async fn schedule_retry(
        &self,
        error_id: Uuid,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut record = self.fetch(error_id).await?;
        record.status = ErrorStatus::Retrying;
        record.retry_count = retry_count;
        record.next_retry_at = Some(next_retry_at);
        self.store.update(record).await
    }

    /// Manual resolution by an operator.
    pub async fn mark_resolved(
        &self,
        error_id: Uuid,
        resolved_by: &str,
        notes: &str,
    ) -> Result<(), StoreError> {
        let mut record = self.fetch(error_id).await?;
        record.status = ErrorStatus::Resolved;
        record.resolved_at = Some(Utc::now());
        record.resolved_by = Some(resolved_by.to_string());
        record.resolution_notes = Some(notes.to_string());
        self.store.update(record).await
    }

    /// Full error history for a document, oldest first.
    pub async fn history(&self, document_id: &str) -> Result<Vec<ErrorRecord>, StoreError> {
        self.store.list_for_document(document_id).await
    }

    /// Fetches a single record.
    pub async fn get(&self, error_id: Uuid) -> Result<Option<ErrorRecord>, StoreError> {
        self.store.get(error_id).await
    }

    async fn fetch(&self, error_id: Uuid) -> Result<ErrorRecord, StoreError> {
        self.store
            .get(error_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(error_id.to_string()))
    }
}
