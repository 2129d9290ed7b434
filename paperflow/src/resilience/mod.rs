//! Pipeline resilience primitives.
//!
//! This module provides:
//! - Fault classification (transient vs permanent)
//! - Retry policy resolution with a single-flight cache
//! - Advisory locks for (document, stage) mutual exclusion
//! - Exponential backoff with jitter
//! - Durable error logging with correlated events
//! - The retry orchestrator composing all of the above

pub mod backoff;
mod classifier;
mod error_log;
mod lock;
mod policy;
mod retry;

pub use classifier::ErrorClassifier;
pub use error_log::{ErrorLogger, FailureReport};
pub use lock::{
    derive_lock_key, AdvisoryLockManager, InProcessLockBackend, LockBackend, LockGuard,
};
pub use policy::RetryPolicyManager;
pub use retry::{AttemptFailure, RetryOrchestrator, RetryOutcome, RetryTerminal};
