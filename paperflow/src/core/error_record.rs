//! Durable, append-only error records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::{ErrorStatus, FaultCategory};

/// One row of the `pipeline_errors` table.
///
/// Created once per failure and never deleted; retry progression and manual
/// resolution mutate the status fields only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Opaque, generated identifier.
    pub error_id: Uuid,
    /// The document whose stage failed.
    pub document_id: String,
    /// The stage that failed.
    pub stage_name: String,
    /// Stable fault-kind label (e.g. `timeout`, `http_503`).
    pub error_type: String,
    /// Transient or permanent, as classified at failure time.
    pub error_category: FaultCategory,
    /// Failure message.
    pub message: String,
    /// Rendered fault chain, outermost first.
    pub stack_trace: Option<String>,
    /// Sanitized key/value context.
    pub context: HashMap<String, String>,
    /// Retry count at the time of the failure.
    pub retry_count: u32,
    /// Retry budget in effect for the stage.
    pub max_retries: u32,
    /// Record lifecycle status.
    pub status: ErrorStatus,
    /// Joins this row with the structured log event for the same failure.
    pub correlation_id: String,
    /// When the next automatic retry is due, if one was scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the record was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it (`retry` for automatic recovery, an operator otherwise).
    pub resolved_by: Option<String>,
    /// Free-form resolution notes. Non-empty whenever retries were exhausted.
    pub resolution_notes: Option<String>,
    /// When the failure was recorded.
    pub created_at: DateTime<Utc>,
}

impl ErrorRecord {
    /// Returns true if the fault was classified transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.error_category.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_through_json() {
        let record = ErrorRecord {
            error_id: Uuid::new_v4(),
            document_id: "doc-1".to_string(),
            stage_name: "embedding".to_string(),
            error_type: "http_503".to_string(),
            error_category: FaultCategory::Transient,
            message: "inference backend unavailable".to_string(),
            stack_trace: None,
            context: HashMap::new(),
            retry_count: 1,
            max_retries: 3,
            status: ErrorStatus::Retrying,
            correlation_id: "req.stage_embedding.retry_1".to_string(),
            next_retry_at: Some(Utc::now()),
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: ErrorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error_id, record.error_id);
        assert!(back.is_transient());
    }
}
