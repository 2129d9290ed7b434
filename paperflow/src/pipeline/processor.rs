//! The external stage processor contract.
//!
//! A processor is a single callable that turns a stage context into an
//! artifact or a fault. Processors know nothing about retries, locks, or
//! idempotency; that is entirely the orchestrator's responsibility.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::context::StageContext;
use crate::cancellation::CancelToken;
use crate::errors::StageFault;

/// Stage names of the standard extraction sequence, in order.
pub const DEFAULT_STAGE_SEQUENCE: [&str; 6] = [
    "text_extraction",
    "image_extraction",
    "classification",
    "code_extraction",
    "embedding",
    "search_index",
];

/// One discrete, idempotent unit of document processing.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// The external collaborator this processor leans on, used for retry
    /// policy resolution.
    fn service_name(&self) -> String {
        "default".to_string()
    }

    /// Processes the stage, producing an artifact or raising a fault.
    async fn process(&self, ctx: &StageContext) -> Result<serde_json::Value, StageFault>;
}

/// A named stage bound to its processor.
#[derive(Clone)]
pub struct StageDefinition {
    /// Stage name, unique within a pipeline.
    pub name: String,
    /// Service name used for policy resolution.
    pub service: String,
    /// The processor invoked for this stage.
    pub processor: Arc<dyn StageProcessor>,
    /// Per-stage timeout override.
    pub timeout: Option<Duration>,
}

impl StageDefinition {
    /// Binds a stage name to a processor, taking the service name from the
    /// processor.
    #[must_use]
    pub fn new(name: impl Into<String>, processor: Arc<dyn StageProcessor>) -> Self {
        let service = processor.service_name();
        Self {
            name: name.into(),
            service,
            processor,
            timeout: None,
        }
    }

    /// Overrides the service used for policy resolution.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Sets a per-stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("service", &self.service)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Invokes a processor bounded by its timeout and the run's cancel token.
///
/// A timeout converts to a transient [`StageFault::timeout`] so it flows
/// through the normal retry path; cancellation converts to a permanent
/// cancelled fault.
pub(crate) async fn invoke(
    stage: &StageDefinition,
    ctx: &StageContext,
    default_timeout: Duration,
    cancel: &CancelToken,
) -> Result<serde_json::Value, StageFault> {
    let timeout = stage.timeout.unwrap_or(default_timeout);

    tokio::select! {
        () = cancel.cancelled() => Err(StageFault::cancelled(
            cancel
                .reason()
                .unwrap_or_else(|| "pipeline cancelled".to_string()),
        )),
        result = tokio::time::timeout(timeout, stage.processor.process(ctx)) => {
            match result {
                Ok(inner) => inner,
                Err(_) => Err(StageFault::timeout(format!(
                    "stage '{}' exceeded its {}ms timeout",
                    stage.name,
                    timeout.as_millis()
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::DocumentContext;

    struct SlowProcessor;

    #[async_trait]
    impl StageProcessor for SlowProcessor {
        async fn process(&self, _ctx: &StageContext) -> Result<serde_json::Value, StageFault> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::json!({}))
        }
    }

    struct EchoProcessor;

    #[async_trait]
    impl StageProcessor for EchoProcessor {
        fn service_name(&self) -> String {
            "inference".to_string()
        }

        async fn process(&self, ctx: &StageContext) -> Result<serde_json::Value, StageFault> {
            Ok(serde_json::json!({"stage": ctx.stage_name()}))
        }
    }

    fn ctx() -> StageContext {
        StageContext::new(
            Arc::new(DocumentContext::new("doc-1", "cafe01", 64)),
            "embedding",
            0,
        )
    }

    #[test]
    fn test_definition_takes_service_from_processor() {
        let stage = StageDefinition::new("embedding", Arc::new(EchoProcessor));
        assert_eq!(stage.service, "inference");

        let overridden = stage.with_service("object_store");
        assert_eq!(overridden.service, "object_store");
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let stage = StageDefinition::new("embedding", Arc::new(EchoProcessor));
        let result = invoke(&stage, &ctx(), Duration::from_secs(5), &CancelToken::new()).await;
        assert_eq!(result.unwrap()["stage"], "embedding");
    }

    #[tokio::test]
    async fn test_invoke_times_out_as_transient_fault() {
        let stage = StageDefinition::new("embedding", Arc::new(SlowProcessor))
            .with_timeout(Duration::from_millis(10));
        let fault = invoke(&stage, &ctx(), Duration::from_secs(5), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(fault.kind, crate::errors::FaultKind::Timeout);
    }

    #[tokio::test]
    async fn test_invoke_observes_cancellation() {
        let stage = StageDefinition::new("embedding", Arc::new(SlowProcessor));
        let cancel = CancelToken::new();
        cancel.cancel("operator abort");

        let fault = invoke(&stage, &ctx(), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert_eq!(fault.kind, crate::errors::FaultKind::Cancelled);
        assert!(fault.message.contains("operator abort"));
    }
}
