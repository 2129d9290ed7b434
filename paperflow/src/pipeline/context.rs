//! Document and stage execution contexts.
//!
//! A [`DocumentContext`] carries the document identity plus the artifacts
//! accumulated by prior stages; a [`StageContext`] is the narrowed view a
//! processor receives for one attempt.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::idempotency::StageFingerprint;
use crate::state::StageStateMachine;
use crate::utils::correlation::new_request_id;

/// Shared, mutable context for one document run.
pub struct DocumentContext {
    /// The document being processed.
    pub document_id: String,
    /// Request ID prefixing every correlation ID of this run.
    pub request_id: String,
    /// Hash of the source content.
    pub content_hash: String,
    /// Size of the source content in bytes.
    pub content_size: u64,
    artifacts: RwLock<HashMap<String, serde_json::Value>>,
}

impl DocumentContext {
    /// Creates a context with a fresh request ID.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        content_hash: impl Into<String>,
        content_size: u64,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            request_id: new_request_id(),
            content_hash: content_hash.into(),
            content_size,
            artifacts: RwLock::new(HashMap::new()),
        }
    }

    /// Overrides the generated request ID (e.g. to continue a prior run).
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Records the artifact a stage produced.
    pub fn record_artifact(&self, stage_name: &str, artifact: serde_json::Value) {
        self.artifacts
            .write()
            .insert(stage_name.to_string(), artifact);
    }

    /// The artifact a stage produced, if recorded.
    #[must_use]
    pub fn artifact(&self, stage_name: &str) -> Option<serde_json::Value> {
        self.artifacts.read().get(stage_name).cloned()
    }

    /// Snapshot of all recorded artifacts.
    #[must_use]
    pub fn artifacts(&self) -> HashMap<String, serde_json::Value> {
        self.artifacts.read().clone()
    }

    /// Fingerprint of the inputs that determine `stage_name`'s output:
    /// document identity, source content, and every artifact recorded by
    /// other stages.
    #[must_use]
    pub fn fingerprint_for(&self, stage_name: &str) -> StageFingerprint {
        let upstream: BTreeMap<String, serde_json::Value> = self
            .artifacts
            .read()
            .iter()
            .filter(|(name, _)| name.as_str() != stage_name)
            .map(|(name, artifact)| (name.clone(), artifact.clone()))
            .collect();

        let mut fingerprint =
            StageFingerprint::new(&self.document_id, &self.content_hash, self.content_size);
        fingerprint.upstream = upstream;
        fingerprint
    }
}

impl std::fmt::Debug for DocumentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentContext")
            .field("document_id", &self.document_id)
            .field("request_id", &self.request_id)
            .field("artifacts", &self.artifacts.read().len())
            .finish()
    }
}

/// Callback a processor uses to report progress, 0–100.
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

/// The view a processor receives for one attempt of one stage.
pub struct StageContext {
    document: Arc<DocumentContext>,
    stage_name: String,
    attempt: u32,
    progress: Option<ProgressSink>,
}

impl StageContext {
    /// Creates a context for an attempt.
    #[must_use]
    pub fn new(document: Arc<DocumentContext>, stage_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            document,
            stage_name: stage_name.into(),
            attempt,
            progress: None,
        }
    }

    /// Attaches a progress sink.
    #[must_use]
    pub fn with_progress_sink(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// The document context.
    #[must_use]
    pub fn document(&self) -> &Arc<DocumentContext> {
        &self.document
    }

    /// The document ID.
    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document.document_id
    }

    /// The stage being executed.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Which attempt this is: 0 for the initial run, n for retry n.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// An upstream stage's artifact, if available.
    #[must_use]
    pub fn upstream_artifact(&self, stage_name: &str) -> Option<serde_json::Value> {
        self.document.artifact(stage_name)
    }

    /// Reports progress, clamped to 0–100 downstream.
    pub fn report_progress(&self, progress: u8) {
        if let Some(sink) = &self.progress {
            sink(progress);
        }
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("document_id", &self.document.document_id)
            .field("stage_name", &self.stage_name)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Builds a progress sink that forwards updates to the state machine.
///
/// Updates are fire-and-forget: a slow or unavailable store never stalls
/// the processor.
#[must_use]
pub fn spawning_progress_sink(
    state: Arc<StageStateMachine>,
    document_id: String,
    stage_name: String,
) -> ProgressSink {
    Arc::new(move |progress| {
        let state = state.clone();
        let document_id = document_id.clone();
        let stage_name = stage_name.clone();
        tokio::spawn(async move {
            state
                .update_progress(&document_id, &stage_name, progress)
                .await;
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifacts_round_trip() {
        let ctx = DocumentContext::new("doc-1", "cafe01", 1024);
        assert!(ctx.artifact("classification").is_none());

        ctx.record_artifact("classification", serde_json::json!({"doc_type": "service_manual"}));
        let artifact = ctx.artifact("classification").unwrap();
        assert_eq!(artifact["doc_type"], "service_manual");
    }

    #[test]
    fn test_fingerprint_excludes_own_stage() {
        let ctx = DocumentContext::new("doc-1", "cafe01", 1024);
        ctx.record_artifact("text_extraction", serde_json::json!({"pages": 3}));

        let before = ctx.fingerprint_for("classification").hash();
        // Recording the stage's own artifact must not change its fingerprint.
        ctx.record_artifact("classification", serde_json::json!({"doc_type": "parts_catalog"}));
        let after = ctx.fingerprint_for("classification").hash();
        assert_eq!(before, after);

        // But it does feed downstream fingerprints.
        let downstream = ctx.fingerprint_for("embedding").hash();
        assert_ne!(downstream, after);
    }

    #[test]
    fn test_stage_context_accessors() {
        let document = Arc::new(DocumentContext::new("doc-1", "cafe01", 64));
        document.record_artifact("text_extraction", serde_json::json!({"pages": 2}));

        let ctx = StageContext::new(document, "classification", 1);
        assert_eq!(ctx.document_id(), "doc-1");
        assert_eq!(ctx.stage_name(), "classification");
        assert_eq!(ctx.attempt(), 1);
        assert!(ctx.upstream_artifact("text_extraction").is_some());
    }

    #[test]
    fn test_report_progress_without_sink_is_noop() {
        let document = Arc::new(DocumentContext::new("doc-1", "cafe01", 64));
        let ctx = StageContext::new(document, "classification", 0);
        ctx.report_progress(50);
    }
}
