//! Small pure helpers: correlation IDs and context sanitization.

pub mod correlation;
pub mod sanitize;

pub use correlation::{correlation_id, new_request_id};
pub use sanitize::sanitize_context;
