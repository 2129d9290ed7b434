//! Retry policy records, keyed by external service and optionally by stage.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Well-known external collaborator names used for policy resolution.
pub mod services {
    /// The object store holding source documents and extracted assets.
    pub const OBJECT_STORE: &str = "object_store";
    /// The relational store backing executions, errors, and markers.
    pub const DATABASE: &str = "database";
    /// The AI inference service (vision, classification, embeddings).
    pub const INFERENCE: &str = "inference";
}

/// One row of the `retry_policies` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The external service this policy applies to.
    pub service_name: String,
    /// Specific stage, or `None` for the service-wide wildcard.
    pub stage_name: Option<String>,
    /// Maximum automatic retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap applied to the computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied per retry (delay = base * exponent^n).
    pub backoff_exponent: f64,
    /// Whether to perturb computed delays by ±20%.
    pub jitter_enabled: bool,
}

impl RetryPolicy {
    /// Creates a service-wide policy with the standard cap and exponent.
    #[must_use]
    pub fn new(service_name: impl Into<String>, max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            service_name: service_name.into(),
            stage_name: None,
            max_retries,
            base_delay_ms,
            max_delay_ms: 30_000,
            backoff_exponent: 2.0,
            jitter_enabled: true,
        }
    }

    /// Narrows the policy to one stage.
    #[must_use]
    pub fn for_stage(mut self, stage_name: impl Into<String>) -> Self {
        self.stage_name = Some(stage_name.into());
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Sets the backoff exponent.
    #[must_use]
    pub fn with_backoff_exponent(mut self, exponent: f64) -> Self {
        self.backoff_exponent = exponent;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    /// The generic policy used when no row matches a service.
    #[must_use]
    pub fn fallback(service_name: impl Into<String>) -> Self {
        Self::new(service_name, 3, 1_000)
    }

    /// Built-in defaults seeded per external collaborator.
    #[must_use]
    pub fn seed_defaults() -> Vec<Self> {
        vec![
            Self::new(services::OBJECT_STORE, 4, 1_500),
            Self::new(services::DATABASE, 5, 1_000),
            Self::new(services::INFERENCE, 3, 2_000),
        ]
    }

    /// Cache key: `"{service}:{stage|*}"`.
    #[must_use]
    pub fn cache_key(service_name: &str, stage_name: Option<&str>) -> String {
        format!("{service_name}:{}", stage_name.unwrap_or("*"))
    }

    /// Base delay as a [`Duration`].
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap as a [`Duration`].
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
