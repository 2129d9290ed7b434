//! # Paperflow
//!
//! A resilient processing pipeline for technical documents (service
//! manuals, parts catalogs). Documents move through a fixed sequence of
//! extraction stages; this crate is the orchestration and resilience core
//! that decides, for each (document, stage) pair, whether to run, skip,
//! retry, or fail, while guaranteeing:
//!
//! - **Mutual exclusion**: at most one concurrent execution per pair,
//!   enforced by advisory locks
//! - **Exactly-once completion recording**: content-hash completion markers
//!   make re-entry after crashes idempotent
//! - **Bounded, classified retries**: transient faults back off
//!   exponentially with jitter up to a per-service policy limit;
//!   permanent faults escalate immediately
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use paperflow::prelude::*;
//!
//! let services = PipelineServices::in_memory();
//! let pipeline = PipelineOrchestrator::new(
//!     vec![
//!         StageDefinition::new("text_extraction", text_processor),
//!         StageDefinition::new("embedding", embedding_processor),
//!     ],
//!     services,
//!     PipelineConfig::default(),
//! );
//!
//! let document = Arc::new(DocumentContext::new("doc-1", content_hash, size));
//! let outcome = pipeline.run_document(document, &CancelToken::new()).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod core;
pub mod errors;
pub mod idempotency;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod state;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancelToken;
    pub use crate::core::{
        CompletionMarker, DocumentStatus, ErrorRecord, ErrorStatus, FaultCategory, RetryPolicy,
        StageExecution, StageStatus,
    };
    pub use crate::errors::{FaultKind, StageFault};
    pub use crate::idempotency::{IdempotencyChecker, StageFingerprint};
    pub use crate::pipeline::{
        CompletionPolicy, DocumentContext, DocumentOutcome, PipelineConfig, PipelineOrchestrator,
        PipelineServices, StageContext, StageDefinition, StageDisposition, StageProcessor,
    };
    pub use crate::resilience::{
        AdvisoryLockManager, ErrorClassifier, ErrorLogger, RetryOrchestrator, RetryOutcome,
        RetryPolicyManager, RetryTerminal,
    };
    pub use crate::state::StageStateMachine;
    pub use crate::utils::{correlation_id, new_request_id};
}
