//! Persisted execution record for a (document, stage) pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StageStatus;

/// One row of the `stage_executions` table.
///
/// Owned exclusively by [`crate::state::StageStateMachine`]; everything else
/// reads these records but mutates them only through its transition methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    /// The document being processed.
    pub document_id: String,
    /// The stage this record tracks.
    pub stage_name: String,
    /// Current status.
    pub status: StageStatus,
    /// Progress percentage, 0–100.
    pub progress: u8,
    /// When the most recent run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Message of the most recent failure, cleared on re-entry.
    pub error_message: Option<String>,
    /// How many retries have been attempted. Never exceeds `max_retries`.
    pub retry_count: u32,
    /// Retry budget resolved from policy when the stage first started.
    pub max_retries: u32,
}

impl StageExecution {
    /// Creates a fresh pending record.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        stage_name: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            stage_name: stage_name.into(),
            status: StageStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries,
        }
    }

    /// Returns true once the record is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true while retry budget remains.
    #[must_use]
    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_execution_is_pending() {
        let exec = StageExecution::new("doc-1", "text_extraction", 3);
        assert_eq!(exec.status, StageStatus::Pending);
        assert_eq!(exec.progress, 0);
        assert_eq!(exec.retry_count, 0);
        assert!(exec.retries_remaining());
        assert!(!exec.is_terminal());
    }

    #[test]
    fn test_retries_remaining_boundary() {
        let mut exec = StageExecution::new("doc-1", "embedding", 2);
        exec.retry_count = 2;
        assert!(!exec.retries_remaining());
    }
}
