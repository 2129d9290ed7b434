//! Tracing setup and span attributes for pipeline runs.

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Installs a global tracing subscriber driven by `RUST_LOG`.
///
/// With `json` enabled, events are emitted as JSON objects so the
/// `correlation_id` field can be joined against durable error records.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    // Another subscriber already installed; keep it.
    drop(result);
}

/// Creates the span wrapping one document run.
#[must_use]
pub fn document_span(document_id: &str, request_id: &str) -> Span {
    tracing::info_span!("document_run", document_id, request_id)
}

/// Creates the span wrapping one stage attempt.
#[must_use]
pub fn stage_span(document_id: &str, stage_name: &str, attempt: u32) -> Span {
    tracing::info_span!("stage_attempt", document_id, stage = stage_name, attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing(false);
        init_tracing(true);
    }

    #[test]
    fn test_spans_carry_fields() {
        let span = document_span("doc-1", "req-1");
        let _entered = span.enter();
        let stage = stage_span("doc-1", "embedding", 2);
        drop(stage);
    }
}
