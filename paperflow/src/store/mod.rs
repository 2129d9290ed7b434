//! Storage seams for the relational store.
//!
//! The relational store is an external collaborator: the crate only ever
//! talks to it through the async traits here. In-memory backends back tests
//! and single-process deployments; a SQL-backed implementation plugs in
//! behind the same traits.

mod memory;

pub use memory::{
    InMemoryErrorStore, InMemoryMarkerStore, InMemoryPolicyStore, InMemoryStateStore,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{CompletionMarker, ErrorRecord, RetryPolicy, StageExecution};

/// Errors surfaced by a storage backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend is unreachable or timed out; usually transient.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The requested record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
    /// A record could not be serialized or deserialized.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Persistence for [`StageExecution`] records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetches the execution record for a (document, stage) pair.
    async fn get(
        &self,
        document_id: &str,
        stage_name: &str,
    ) -> Result<Option<StageExecution>, StoreError>;

    /// Inserts or replaces the execution record (transactional upsert).
    async fn upsert(&self, execution: StageExecution) -> Result<(), StoreError>;

    /// Lists all execution records for a document.
    async fn list_for_document(&self, document_id: &str)
        -> Result<Vec<StageExecution>, StoreError>;
}

/// Persistence for [`ErrorRecord`] rows. Append-only: there is no delete.
#[async_trait]
pub trait ErrorStore: Send + Sync {
    /// Appends a new error record.
    async fn insert(&self, record: ErrorRecord) -> Result<(), StoreError>;

    /// Fetches a record by ID.
    async fn get(&self, error_id: Uuid) -> Result<Option<ErrorRecord>, StoreError>;

    /// Replaces an existing record (status mutation only).
    async fn update(&self, record: ErrorRecord) -> Result<(), StoreError>;

    /// Lists all error records for a document, oldest first.
    async fn list_for_document(&self, document_id: &str) -> Result<Vec<ErrorRecord>, StoreError>;
}

/// Persistence for [`CompletionMarker`] records.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Fetches the marker for a (document, stage) pair.
    async fn get(
        &self,
        document_id: &str,
        stage_name: &str,
    ) -> Result<Option<CompletionMarker>, StoreError>;

    /// Inserts or replaces the marker (one row per pair).
    async fn upsert(&self, marker: CompletionMarker) -> Result<(), StoreError>;

    /// Deletes the marker, returning whether one existed.
    async fn delete(&self, document_id: &str, stage_name: &str) -> Result<bool, StoreError>;

    /// Purges markers completed before the cutoff; returns how many went.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Read access to the `retry_policies` configuration table.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Loads the policy row for a service and optional stage.
    ///
    /// `stage_name: None` addresses the service-wide wildcard row.
    async fn load(
        &self,
        service_name: &str,
        stage_name: Option<&str>,
    ) -> Result<Option<RetryPolicy>, StoreError>;
}
