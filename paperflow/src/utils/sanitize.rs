//! Context sanitization for durable error records.

use std::collections::HashMap;

/// Placeholder written in place of sensitive values.
pub const REDACTED: &str = "[redacted]";

const SENSITIVE_KEY_PARTS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "cookie",
    "credential",
];

/// Returns true if the key looks like it carries a credential.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lowered.contains(part))
}

/// Replaces the values of sensitive keys with [`REDACTED`].
#[must_use]
pub fn sanitize_context(context: &HashMap<String, String>) -> HashMap<String, String> {
    context
        .iter()
        .map(|(k, v)| {
            let value = if is_sensitive_key(k) {
                REDACTED.to_string()
            } else {
                v.clone()
            };
            (k.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_keys() {
        assert!(is_sensitive_key("api_key"));
        assert!(is_sensitive_key("Authorization"));
        assert!(is_sensitive_key("s3_secret_access_key"));
        assert!(!is_sensitive_key("document_id"));
        assert!(!is_sensitive_key("page_count"));
    }

    #[test]
    fn test_sanitize_context_redacts_values() {
        let mut context = HashMap::new();
        context.insert("document_id".to_string(), "doc-1".to_string());
        context.insert("inference_token".to_string(), "tk-abc123".to_string());

        let sanitized = sanitize_context(&context);
        assert_eq!(sanitized.get("document_id"), Some(&"doc-1".to_string()));
        assert_eq!(sanitized.get("inference_token"), Some(&REDACTED.to_string()));
    }
}
