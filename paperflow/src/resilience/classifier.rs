//! Fault classification into transient and permanent categories.

use regex::Regex;

use crate::core::FaultCategory;
use crate::errors::{FaultKind, StageFault};

/// Message patterns that signal a transient condition even when the fault
/// kind itself is unrecognized.
const TRANSIENT_MESSAGE_PATTERN: &str = "(?i)(timed? ?out|connection reset|connection refused|\
temporarily unavailable|service unavailable|too many requests)";

/// Maps faults to [`FaultCategory::Transient`] or
/// [`FaultCategory::Permanent`].
///
/// Classification is deterministic: the same fault always yields the same
/// category. The whole `caused-by` chain is examined before giving up, and
/// anything unrecognized defaults to permanent so an unclassified condition
/// is never retried indefinitely.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    transient_messages: Option<Regex>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Creates a classifier with the built-in message patterns.
    #[must_use]
    pub fn new() -> Self {
        // The pattern is a literal; compilation is covered by tests.
        Self {
            transient_messages: Regex::new(TRANSIENT_MESSAGE_PATTERN).ok(),
        }
    }

    /// Classifies a fault, walking its cause chain.
    #[must_use]
    pub fn classify(&self, fault: &StageFault) -> FaultCategory {
        for frame in fault.chain() {
            if let Some(category) = Self::classify_kind(&frame.kind) {
                return category;
            }
        }

        // No kind was decisive; fall back to message patterns.
        for frame in fault.chain() {
            if self.message_is_transient(&frame.message) {
                return FaultCategory::Transient;
            }
        }

        FaultCategory::Permanent
    }

    fn classify_kind(kind: &FaultKind) -> Option<FaultCategory> {
        match kind {
            FaultKind::Timeout
            | FaultKind::ConnectionReset
            | FaultKind::ConnectionRefused
            | FaultKind::ServiceUnavailable
            | FaultKind::Io => Some(FaultCategory::Transient),
            FaultKind::Http(code) => match code {
                408 | 429 | 500..=599 => Some(FaultCategory::Transient),
                400..=499 => Some(FaultCategory::Permanent),
                _ => None,
            },
            FaultKind::Validation
            | FaultKind::Authentication
            | FaultKind::Authorization
            | FaultKind::Cancelled => Some(FaultCategory::Permanent),
            FaultKind::Other(_) => None,
        }
    }

    fn message_is_transient(&self, message: &str) -> bool {
        self.transient_messages
            .as_ref()
            .is_some_and(|re| re.is_match(message))
    }
}
