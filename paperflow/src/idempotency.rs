//! Content-hash based "already done" checks for stage executions.
//!
//! A [`StageFingerprint`] hashes the stable inputs that determine a stage's
//! output: document identity, source content hash and size, and the
//! artifacts accumulated by upstream stages. A completion marker whose hash
//! matches a freshly computed fingerprint means the stage can be skipped; a
//! differing hash means the inputs changed and the marker is stale.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::CompletionMarker;
use crate::store::{MarkerStore, StoreError};

/// The stable inputs that determine a stage's output.
#[derive(Debug, Clone)]
pub struct StageFingerprint {
    /// The document being processed.
    pub document_id: String,
    /// Hash of the source content.
    pub content_hash: String,
    /// Size of the source content in bytes.
    pub content_size: u64,
    /// Upstream artifacts this stage consumes, keyed by stage name.
    /// A `BTreeMap` keeps the serialization order deterministic.
    pub upstream: BTreeMap<String, serde_json::Value>,
}

impl StageFingerprint {
    /// Creates a fingerprint with no upstream artifacts.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        content_hash: impl Into<String>,
        content_size: u64,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            content_hash: content_hash.into(),
            content_size,
            upstream: BTreeMap::new(),
        }
    }

    /// Adds an upstream artifact.
    #[must_use]
    pub fn with_upstream(mut self, stage_name: impl Into<String>, artifact: serde_json::Value) -> Self {
        self.upstream.insert(stage_name.into(), artifact);
        self
    }

    /// Computes the fingerprint hash.
    #[must_use]
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.document_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(self.content_hash.as_bytes());
        hasher.update(b"\x00");
        hasher.update(self.content_size.to_be_bytes());
        for (stage, artifact) in &self.upstream {
            hasher.update(b"\x00");
            hasher.update(stage.as_bytes());
            hasher.update(b"=");
            hasher.update(serde_json::to_string(artifact).unwrap_or_default().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Checks and records stage completion markers.
pub struct IdempotencyChecker {
    store: Arc<dyn MarkerStore>,
}

impl IdempotencyChecker {
    /// Creates a checker over the given marker store.
    #[must_use]
    pub fn new(store: Arc<dyn MarkerStore>) -> Self {
        Self { store }
    }

    /// Fetches the marker for a (document, stage) pair, if any.
    pub async fn check(
        &self,
        document_id: &str,
        stage_name: &str,
    ) -> Result<Option<CompletionMarker>, StoreError> {
        self.store.get(document_id, stage_name).await
    }

    /// Returns the marker only if it covers the given fingerprint hash.
    pub async fn check_current(
        &self,
        document_id: &str,
        stage_name: &str,
        data_hash: &str,
    ) -> Result<Option<CompletionMarker>, StoreError> {
        Ok(self
            .check(document_id, stage_name)
            .await?
            .filter(|marker| marker.matches(data_hash)))
    }

    /// Upserts the marker after a successful stage execution.
    pub async fn set(
        &self,
        document_id: &str,
        stage_name: &str,
        data_hash: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.store
            .upsert(CompletionMarker::new(
                document_id,
                stage_name,
                data_hash,
                metadata,
            ))
            .await
    }

    /// Drops a stale marker; returns whether one existed.
    pub async fn invalidate(
        &self,
        document_id: &str,
        stage_name: &str,
    ) -> Result<bool, StoreError> {
        self.store.delete(document_id, stage_name).await
    }

    /// Purges markers completed before the cutoff; returns how many went.
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        self.store.purge_older_than(older_than).await
    }
}
