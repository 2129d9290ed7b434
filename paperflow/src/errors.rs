//! Fault model for pipeline stage failures.
//!
//! A stage failure is represented as a tagged [`StageFault`] carrying a
//! variant kind, a message, site-captured context, and an optional wrapped
//! cause. Classification into transient/permanent is a separate pure
//! function (see [`crate::resilience::ErrorClassifier`]), so call sites
//! never need to know retry semantics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The kind of failure a stage raised.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// An operation exceeded its deadline.
    Timeout,
    /// The peer closed the connection mid-exchange.
    ConnectionReset,
    /// The peer refused the connection.
    ConnectionRefused,
    /// An explicit "service unavailable" signal from a collaborator.
    ServiceUnavailable,
    /// An HTTP response with the given status code.
    Http(u16),
    /// A transient I/O failure (disk busy, interrupted read).
    Io,
    /// Input failed validation; retrying cannot help.
    Validation,
    /// The caller could not be authenticated.
    Authentication,
    /// The caller is not allowed to perform the operation.
    Authorization,
    /// The surrounding run was cancelled.
    Cancelled,
    /// Anything else, tagged with the original type name.
    Other(String),
}

impl FaultKind {
    /// Stable label used for the `error_type` column of durable records.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Timeout => "timeout".to_string(),
            Self::ConnectionReset => "connection_reset".to_string(),
            Self::ConnectionRefused => "connection_refused".to_string(),
            Self::ServiceUnavailable => "service_unavailable".to_string(),
            Self::Http(code) => format!("http_{code}"),
            Self::Io => "io".to_string(),
            Self::Validation => "validation".to_string(),
            Self::Authentication => "authentication".to_string(),
            Self::Authorization => "authorization".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            Self::Other(name) => name.clone(),
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A failure raised by a stage processor or one of its collaborators.
///
/// Faults form a `caused-by` chain through [`StageFault::source`]; the
/// classifier walks the whole chain before giving up on a category.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StageFault {
    /// What kind of failure this is.
    pub kind: FaultKind,
    /// Human-readable description.
    pub message: String,
    /// Key/value context captured at the failure site.
    pub context: HashMap<String, String>,
    /// The underlying fault, if this one wraps another.
    #[source]
    pub source: Option<Box<StageFault>>,
}

impl StageFault {
    /// Creates a fault of the given kind.
    #[must_use]
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: HashMap::new(),
            source: None,
        }
    }

    /// A deadline was exceeded.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message)
    }

    /// The peer reset the connection.
    #[must_use]
    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ConnectionReset, message)
    }

    /// The peer refused the connection.
    #[must_use]
    pub fn connection_refused(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ConnectionRefused, message)
    }

    /// A collaborator reported itself unavailable.
    #[must_use]
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ServiceUnavailable, message)
    }

    /// An HTTP response with the given status.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Http(status), message)
    }

    /// A transient I/O failure.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Io, message)
    }

    /// Input failed validation.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Validation, message)
    }

    /// Authentication failed.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Authentication, message)
    }

    /// Authorization failed.
    #[must_use]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Authorization, message)
    }

    /// The run was cancelled.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Cancelled, message)
    }

    /// An unrecognized failure, tagged with its original type name.
    #[must_use]
    pub fn other(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Other(type_name.into()), message)
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Wraps an underlying fault as the cause of this one.
    #[must_use]
    pub fn caused_by(mut self, cause: StageFault) -> Self {
        self.source = Some(Box::new(cause));
        self
    }

    /// Iterates the fault chain from this fault to the root cause.
    pub fn chain(&self) -> impl Iterator<Item = &StageFault> {
        std::iter::successors(Some(self), |f| f.source.as_deref())
    }

    /// Returns the innermost fault in the chain.
    #[must_use]
    pub fn root_cause(&self) -> &StageFault {
        let mut current = self;
        while let Some(cause) = current.source.as_deref() {
            current = cause;
        }
        current
    }

    /// Merged context of the whole chain; outer entries win on key clashes.
    #[must_use]
    pub fn context_chain(&self) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        // Innermost first so outer frames override.
        let frames: Vec<&Self> = self.chain().collect();
        for fault in frames.into_iter().rev() {
            for (k, v) in &fault.context {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// Renders the chain as one string, outermost fault first.
    ///
    /// Stored in the `stack_trace` column of durable error records.
    #[must_use]
    pub fn render_chain(&self) -> String {
        self.chain()
            .map(|f| format!("{}: {}", f.kind, f.message))
            .collect::<Vec<_>>()
            .join("\ncaused by: ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kind_labels() {
        assert_eq!(FaultKind::Timeout.label(), "timeout");
        assert_eq!(FaultKind::Http(503).label(), "http_503");
        assert_eq!(FaultKind::Other("PdfParseError".to_string()).label(), "PdfParseError");
    }

    #[test]
    fn test_fault_display_uses_message() {
        let fault = StageFault::timeout("inference call exceeded 30s");
        assert_eq!(fault.to_string(), "inference call exceeded 30s");
    }

    #[test]
    fn test_chain_walks_to_root() {
        let root = StageFault::connection_reset("socket closed");
        let mid = StageFault::http(502, "bad gateway").caused_by(root);
        let outer = StageFault::other("EmbeddingError", "embedding request failed").caused_by(mid);

        let kinds: Vec<String> = outer.chain().map(|f| f.kind.label()).collect();
        assert_eq!(kinds, vec!["EmbeddingError", "http_502", "connection_reset"]);
        assert_eq!(outer.root_cause().kind, FaultKind::ConnectionReset);
    }

    #[test]
    fn test_context_chain_outer_wins() {
        let inner = StageFault::io("read failed").with_context("path", "/tmp/a");
        let outer = StageFault::other("Wrapper", "wrapped")
            .with_context("path", "/tmp/b")
            .caused_by(inner);

        let merged = outer.context_chain();
        assert_eq!(merged.get("path"), Some(&"/tmp/b".to_string()));
    }

    #[test]
    fn test_render_chain() {
        let fault = StageFault::other("OcrError", "ocr failed")
            .caused_by(StageFault::timeout("vision call timed out"));
        let rendered = fault.render_chain();
        assert!(rendered.starts_with("OcrError: ocr failed"));
        assert!(rendered.contains("caused by: timeout: vision call timed out"));
    }

    #[test]
    fn test_std_error_source() {
        let fault = StageFault::http(500, "server error")
            .caused_by(StageFault::connection_reset("reset"));
        let source = std::error::Error::source(&fault);
        assert!(source.is_some());
    }
}
