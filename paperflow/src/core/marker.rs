//! Completion markers asserting "this (document, stage) already produced
//! output for this input hash".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the `stage_completion_markers` table.
///
/// Upserted once per successful stage execution. A re-run with an identical
/// hash is skipped; a differing hash means the inputs changed and the marker
/// must be invalidated and recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMarker {
    /// The document the output belongs to.
    pub document_id: String,
    /// The stage that produced the output.
    pub stage_name: String,
    /// When the stage completed.
    pub completed_at: DateTime<Utc>,
    /// Fingerprint hash of the inputs that determined the output.
    pub data_hash: String,
    /// Stage artifact, kept so a skipped re-run can rehydrate downstream
    /// stages without re-invoking the processor.
    pub metadata: serde_json::Value,
}

impl CompletionMarker {
    /// Creates a marker stamped with the current time.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        stage_name: impl Into<String>,
        data_hash: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            stage_name: stage_name.into(),
            completed_at: Utc::now(),
            data_hash: data_hash.into(),
            metadata,
        }
    }

    /// Returns true if the marker still covers the given input hash.
    #[must_use]
    pub fn matches(&self, data_hash: &str) -> bool {
        self.data_hash == data_hash
    }
}
