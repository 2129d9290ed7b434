//! In-memory storage backends.
//!
//! Used by tests and single-process deployments. All maps are guarded by
//! `parking_lot` mutexes; every method is a single critical section, so the
//! upsert semantics match a transactional relational backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use super::{ErrorStore, MarkerStore, PolicyStore, StateStore, StoreError};
use crate::core::{CompletionMarker, ErrorRecord, RetryPolicy, StageExecution};

type PairKey = (String, String);

fn pair_key(document_id: &str, stage_name: &str) -> PairKey {
    (document_id.to_string(), stage_name.to_string())
}

/// In-memory [`StateStore`].
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: Mutex<HashMap<PairKey, StageExecution>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(
        &self,
        document_id: &str,
        stage_name: &str,
    ) -> Result<Option<StageExecution>, StoreError> {
        Ok(self
            .records
            .lock()
            .get(&pair_key(document_id, stage_name))
            .cloned())
    }

    async fn upsert(&self, execution: StageExecution) -> Result<(), StoreError> {
        let key = pair_key(&execution.document_id, &execution.stage_name);
        self.records.lock().insert(key, execution);
        Ok(())
    }

    async fn list_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<StageExecution>, StoreError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect())
    }
}

/// In-memory [`ErrorStore`]. Preserves insertion order per document.
#[derive(Debug, Default)]
pub struct InMemoryErrorStore {
    records: Mutex<Vec<ErrorRecord>>,
}

impl InMemoryErrorStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ErrorStore for InMemoryErrorStore {
    async fn insert(&self, record: ErrorRecord) -> Result<(), StoreError> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn get(&self, error_id: Uuid) -> Result<Option<ErrorRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .find(|r| r.error_id == error_id)
            .cloned())
    }

    async fn update(&self, record: ErrorRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.error_id == record.error_id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StoreError::NotFound(record.error_id.to_string())),
        }
    }

    async fn list_for_document(&self, document_id: &str) -> Result<Vec<ErrorRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect())
    }
}

/// In-memory [`MarkerStore`].
#[derive(Debug, Default)]
pub struct InMemoryMarkerStore {
    markers: Mutex<HashMap<PairKey, CompletionMarker>>,
}

impl InMemoryMarkerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of markers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.markers.lock().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.lock().is_empty()
    }
}

#[async_trait]
impl MarkerStore for InMemoryMarkerStore {
    async fn get(
        &self,
        document_id: &str,
        stage_name: &str,
    ) -> Result<Option<CompletionMarker>, StoreError> {
        Ok(self
            .markers
            .lock()
            .get(&pair_key(document_id, stage_name))
            .cloned())
    }

    async fn upsert(&self, marker: CompletionMarker) -> Result<(), StoreError> {
        let key = pair_key(&marker.document_id, &marker.stage_name);
        self.markers.lock().insert(key, marker);
        Ok(())
    }

    async fn delete(&self, document_id: &str, stage_name: &str) -> Result<bool, StoreError> {
        Ok(self
            .markers
            .lock()
            .remove(&pair_key(document_id, stage_name))
            .is_some())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut markers = self.markers.lock();
        let before = markers.len();
        markers.retain(|_, m| m.completed_at >= cutoff);
        Ok(before - markers.len())
    }
}

/// In-memory [`PolicyStore`], seeded with the per-collaborator defaults.
///
/// Tracks how many loads reached the backing table, which lets tests verify
/// that concurrent first-time lookups collapse into a single load.
#[derive(Debug)]
pub struct InMemoryPolicyStore {
    policies: Mutex<HashMap<String, RetryPolicy>>,
    loads: AtomicUsize,
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::seeded()
    }
}

impl InMemoryPolicyStore {
    /// Creates a store with no rows.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            policies: Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        }
    }

    /// Creates a store seeded with [`RetryPolicy::seed_defaults`].
    #[must_use]
    pub fn seeded() -> Self {
        let store = Self::empty();
        for policy in RetryPolicy::seed_defaults() {
            store.put(policy);
        }
        store
    }

    /// Inserts or replaces a policy row.
    pub fn put(&self, policy: RetryPolicy) {
        let key = RetryPolicy::cache_key(&policy.service_name, policy.stage_name.as_deref());
        self.policies.lock().insert(key, policy);
    }

    /// Number of loads that reached the table.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn load(
        &self,
        service_name: &str,
        stage_name: Option<&str>,
    ) -> Result<Option<RetryPolicy>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let key = RetryPolicy::cache_key(service_name, stage_name);
        Ok(self.policies.lock().get(&key).cloned())
    }
}
