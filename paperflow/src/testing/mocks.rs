//! Mock stage processors for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::errors::StageFault;
use crate::pipeline::context::StageContext;
use crate::pipeline::processor::StageProcessor;

/// A processor that succeeds and counts its invocations.
#[derive(Debug)]
pub struct CountingProcessor {
    service: String,
    artifact: serde_json::Value,
    calls: Mutex<u32>,
}

impl CountingProcessor {
    /// Creates a counting processor returning an empty artifact.
    #[must_use]
    pub fn new() -> Self {
        Self::with_artifact(serde_json::json!({}))
    }

    /// Creates a counting processor returning the given artifact.
    #[must_use]
    pub fn with_artifact(artifact: serde_json::Value) -> Self {
        Self {
            service: "default".to_string(),
            artifact,
            calls: Mutex::new(0),
        }
    }

    /// Sets the service name reported for policy resolution.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// How many times the processor ran.
    #[must_use]
    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

impl Default for CountingProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageProcessor for CountingProcessor {
    fn service_name(&self) -> String {
        self.service.clone()
    }

    async fn process(&self, _ctx: &StageContext) -> Result<serde_json::Value, StageFault> {
        *self.calls.lock() += 1;
        Ok(self.artifact.clone())
    }
}

/// A processor that always raises the configured fault.
pub struct FailingProcessor {
    fault: Arc<dyn Fn() -> StageFault + Send + Sync>,
    calls: Mutex<u32>,
}

impl FailingProcessor {
    /// Creates a processor raising a fresh fault per call.
    #[must_use]
    pub fn new<F>(fault: F) -> Self
    where
        F: Fn() -> StageFault + Send + Sync + 'static,
    {
        Self {
            fault: Arc::new(fault),
            calls: Mutex::new(0),
        }
    }

    /// How many times the processor ran.
    #[must_use]
    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl StageProcessor for FailingProcessor {
    async fn process(&self, _ctx: &StageContext) -> Result<serde_json::Value, StageFault> {
        *self.calls.lock() += 1;
        Err((self.fault)())
    }
}

/// A processor that fails a fixed number of times, then succeeds.
///
/// Models a transient condition that clears mid-retry-chain.
pub struct FlakyProcessor {
    failures_before_success: u32,
    fault: Arc<dyn Fn() -> StageFault + Send + Sync>,
    artifact: serde_json::Value,
    calls: Mutex<u32>,
}

impl FlakyProcessor {
    /// Creates a processor failing `failures_before_success` times.
    #[must_use]
    pub fn new<F>(failures_before_success: u32, fault: F) -> Self
    where
        F: Fn() -> StageFault + Send + Sync + 'static,
    {
        Self {
            failures_before_success,
            fault: Arc::new(fault),
            artifact: serde_json::json!({"recovered": true}),
            calls: Mutex::new(0),
        }
    }

    /// Sets the artifact returned on success.
    #[must_use]
    pub fn with_artifact(mut self, artifact: serde_json::Value) -> Self {
        self.artifact = artifact;
        self
    }

    /// How many times the processor ran.
    #[must_use]
    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl StageProcessor for FlakyProcessor {
    async fn process(&self, _ctx: &StageContext) -> Result<serde_json::Value, StageFault> {
        let mut calls = self.calls.lock();
        *calls += 1;
        if *calls <= self.failures_before_success {
            Err((self.fault)())
        } else {
            Ok(self.artifact.clone())
        }
    }
}
