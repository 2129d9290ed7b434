//! Retry policy resolution with a single-flight cache.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::core::RetryPolicy;
use crate::store::PolicyStore;

/// Resolves and caches retry policies per `(service, stage)` key.
///
/// Constructed once per process and passed by reference to the
/// orchestrators. Concurrent first-time lookups for the same key collapse
/// into a single store load; later lookups hit the cache until it is
/// explicitly invalidated.
pub struct RetryPolicyManager {
    store: Arc<dyn PolicyStore>,
    cache: DashMap<String, Arc<OnceCell<RetryPolicy>>>,
}

impl RetryPolicyManager {
    /// Creates a manager backed by the given configuration table.
    #[must_use]
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Resolves the policy for a service and optional stage.
    ///
    /// Resolution order: exact `(service, stage)` row, then the service-wide
    /// wildcard row, then the built-in fallback. A store failure degrades to
    /// the fallback; policy resolution never blocks the retry path.
    pub async fn resolve(&self, service_name: &str, stage_name: Option<&str>) -> RetryPolicy {
        let key = RetryPolicy::cache_key(service_name, stage_name);
        let cell = self
            .cache
            .entry(key)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_init(|| self.load(service_name, stage_name))
            .await
            .clone()
    }

    async fn load(&self, service_name: &str, stage_name: Option<&str>) -> RetryPolicy {
        if stage_name.is_some() {
            match self.store.load(service_name, stage_name).await {
                Ok(Some(policy)) => return policy,
                Ok(None) => {}
                Err(e) => {
                    warn!(service = service_name, error = %e, "policy load failed, using fallback");
                    return RetryPolicy::fallback(service_name);
                }
            }
        }
        match self.store.load(service_name, None).await {
            Ok(Some(policy)) => policy,
            Ok(None) => RetryPolicy::fallback(service_name),
            Err(e) => {
                warn!(service = service_name, error = %e, "policy load failed, using fallback");
                RetryPolicy::fallback(service_name)
            }
        }
    }

    /// Drops the cached entry for one `(service, stage)` key.
    pub fn invalidate(&self, service_name: &str, stage_name: Option<&str>) {
        self.cache
            .remove(&RetryPolicy::cache_key(service_name, stage_name));
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of cached keys.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::services;
    use crate::store::InMemoryPolicyStore;

    #[tokio::test]
    async fn test_resolves_seeded_service() {
        let store = Arc::new(InMemoryPolicyStore::seeded());
        let manager = RetryPolicyManager::new(store);

        let policy = manager.resolve(services::INFERENCE, None).await;
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay_ms, 2_000);
    }

    #[tokio::test]
    async fn test_stage_row_overrides_wildcard() {
        let store = Arc::new(InMemoryPolicyStore::seeded());
        store.put(
            RetryPolicy::new(services::INFERENCE, 6, 250).for_stage("embedding"),
        );
        let manager = RetryPolicyManager::new(store);

        let policy = manager
            .resolve(services::INFERENCE, Some("embedding"))
            .await;
        assert_eq!(policy.max_retries, 6);

        let other = manager
            .resolve(services::INFERENCE, Some("classification"))
            .await;
        assert_eq!(other.max_retries, 3);
    }

    #[tokio::test]
    async fn test_unknown_service_gets_fallback() {
        let store = Arc::new(InMemoryPolicyStore::empty());
        let manager = RetryPolicyManager::new(store);

        let policy = manager.resolve("unheard_of", None).await;
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay_ms, 1_000);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_single_flight() {
        let store = Arc::new(InMemoryPolicyStore::seeded());
        let manager = Arc::new(RetryPolicyManager::new(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.resolve(services::DATABASE, None).await
            }));
        }
        for handle in handles {
            let policy = handle.await.unwrap();
            assert_eq!(policy.max_retries, 5);
        }

        // All sixteen lookups collapse into one table load.
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let store = Arc::new(InMemoryPolicyStore::seeded());
        let manager = RetryPolicyManager::new(store.clone());

        manager.resolve(services::DATABASE, None).await;
        assert_eq!(store.load_count(), 1);

        manager.resolve(services::DATABASE, None).await;
        assert_eq!(store.load_count(), 1);

        manager.invalidate(services::DATABASE, None);
        manager.resolve(services::DATABASE, None).await;
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn test_clear_empties_cache() {
        let store = Arc::new(InMemoryPolicyStore::seeded());
        let manager = RetryPolicyManager::new(store);

        manager.resolve(services::DATABASE, None).await;
        manager.resolve(services::INFERENCE, None).await;
        assert_eq!(manager.cached_len(), 2);

        manager.clear();
        assert_eq!(manager.cached_len(), 0);
    }
}
