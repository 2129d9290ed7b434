//! Status enums for stage executions, documents, and error records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a (document, stage) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not started yet.
    Pending,
    /// Stage is currently executing.
    Running,
    /// Stage finished successfully.
    Completed,
    /// Stage failed terminally.
    Failed,
    /// Stage was skipped (a valid completion marker already covered it).
    Skipped,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true if the stage produced (or already had) its output.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Aggregated processing status of a whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// No stage has run yet.
    Pending,
    /// At least one stage is running or has a retry in flight.
    Processing,
    /// The document completed under the configured completion policy.
    Completed,
    /// The document failed under the configured completion policy.
    Failed,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle status of a durable error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    /// Recorded, no retry decision taken yet.
    Open,
    /// A retry has been scheduled or is in flight.
    Retrying,
    /// Resolved, either by a successful retry or by an operator.
    Resolved,
    /// Terminally failed; no further automatic retries.
    Failed,
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Retrying => write!(f, "retrying"),
            Self::Resolved => write!(f, "resolved"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Whether a fault is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCategory {
    /// Retryable up to the policy limit.
    Transient,
    /// Never retried automatically.
    Permanent,
}

impl FaultCategory {
    /// Returns true for [`FaultCategory::Transient`].
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_terminal() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_stage_status_success() {
        assert!(StageStatus::Completed.is_success());
        assert!(StageStatus::Skipped.is_success());
        assert!(!StageStatus::Failed.is_success());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&StageStatus::Running).unwrap();
        assert_eq!(json, r#""running""#);
        let json = serde_json::to_string(&ErrorStatus::Retrying).unwrap();
        assert_eq!(json, r#""retrying""#);
        let json = serde_json::to_string(&FaultCategory::Transient).unwrap();
        assert_eq!(json, r#""transient""#);
    }

    #[test]
    fn test_display() {
        assert_eq!(StageStatus::Skipped.to_string(), "skipped");
        assert_eq!(DocumentStatus::Processing.to_string(), "processing");
        assert_eq!(FaultCategory::Permanent.to_string(), "permanent");
    }
}
