//! Correlation IDs threading together the log and error entries of one
//! retry chain.
//!
//! Format: `{request_id}.stage_{stage_name}.retry_{n}`. All entries of a
//! chain share the request prefix; the retry suffix increases strictly.

use uuid::Uuid;

/// Generates a fresh request ID.
#[must_use]
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Builds the correlation ID for one attempt of a retry chain.
#[must_use]
pub fn correlation_id(request_id: &str, stage_name: &str, retry_count: u32) -> String {
    format!("{request_id}.stage_{stage_name}.retry_{retry_count}")
}

/// Extracts the retry index from a correlation ID, if well-formed.
#[must_use]
pub fn retry_index(correlation_id: &str) -> Option<u32> {
    correlation_id
        .rsplit_once(".retry_")
        .and_then(|(_, n)| n.parse().ok())
}

/// Extracts the request prefix (everything before `.stage_`).
#[must_use]
pub fn request_prefix(correlation_id: &str) -> Option<&str> {
    correlation_id.split_once(".stage_").map(|(prefix, _)| prefix)
}
