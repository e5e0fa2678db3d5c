use std::sync::Arc;

use async_trait::async_trait;

use super::{cache_key, CacheBackend, PersistenceBackend, StoredEntry};
use crate::error::StoreError;

/// Primary storage for one entity kind. Chosen once when a store is built so
/// call sites never branch on the "persist in cache" flags themselves.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageTier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load(&self, partition: &str, key: &str) -> Result<Option<StoredEntry>, StoreError>;

    /// Writes a new entry and returns its version.
    async fn insert(&self, entry: &StoredEntry, ttl_seconds: u64) -> Result<i64, StoreError>;

    /// Overwrites an existing entry and returns its new version.
    async fn replace(&self, entry: &StoredEntry, ttl_seconds: u64) -> Result<i64, StoreError>;

    async fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError>;

    /// Whether equality-filter queries can be answered by this tier.
    fn supports_queries(&self) -> bool;
}

pub struct CacheTier {
    cache: Arc<dyn CacheBackend>,
}

impl CacheTier {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl StorageTier for CacheTier {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn load(&self, partition: &str, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        self.cache.get(&cache_key(partition, key)).await
    }

    async fn insert(&self, entry: &StoredEntry, ttl_seconds: u64) -> Result<i64, StoreError> {
        let stored = entry.clone().with_version(entry.version + 1);
        self.cache.put(&entry.cache_key(), &stored, ttl_seconds).await?;
        Ok(stored.version)
    }

    async fn replace(&self, entry: &StoredEntry, ttl_seconds: u64) -> Result<i64, StoreError> {
        self.insert(entry, ttl_seconds).await
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError> {
        self.cache.remove(&cache_key(partition, key)).await
    }

    fn supports_queries(&self) -> bool {
        false
    }
}

pub struct DurableTier {
    backend: Arc<dyn PersistenceBackend>,
}

impl DurableTier {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl StorageTier for DurableTier {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn load(&self, partition: &str, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        self.backend.find(partition, key).await
    }

    async fn insert(&self, entry: &StoredEntry, _ttl_seconds: u64) -> Result<i64, StoreError> {
        self.backend.persist(entry).await
    }

    async fn replace(&self, entry: &StoredEntry, _ttl_seconds: u64) -> Result<i64, StoreError> {
        self.backend.merge(entry).await
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError> {
        self.backend.remove(partition, key).await.map(|_| ())
    }

    fn supports_queries(&self) -> bool {
        true
    }
}

pub fn select_tier(
    persist_in_cache: bool,
    backend: Arc<dyn PersistenceBackend>,
    cache: Arc<dyn CacheBackend>,
) -> Arc<dyn StorageTier> {
    if persist_in_cache {
        Arc::new(CacheTier::new(cache))
    } else {
        Arc::new(DurableTier::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MockCacheBackend, MockPersistenceBackend};
    use mockall::predicate::eq;

    fn entry() -> StoredEntry {
        StoredEntry::encode("sessions", "session", "s-1", &serde_json::json!({ "a": "b" }))
            .expect("encode")
    }

    #[tokio::test]
    async fn cache_tier_writes_only_to_cache() {
        let mut cache = MockCacheBackend::new();
        cache
            .expect_put()
            .withf(|key, entry, ttl| key == "sessions:s-1" && entry.version == 1 && *ttl == 60)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let backend = MockPersistenceBackend::new();

        let tier = select_tier(true, Arc::new(backend), Arc::new(cache));
        assert_eq!(tier.name(), "cache");
        let version = tier.insert(&entry(), 60).await.expect("insert");
        assert_eq!(version, 1);
        assert!(!tier.supports_queries());
    }

    #[tokio::test]
    async fn durable_tier_merges_through_backend() {
        let mut backend = MockPersistenceBackend::new();
        backend.expect_merge().times(1).returning(|_| Ok(4));
        backend
            .expect_remove()
            .with(eq("sessions"), eq("s-1"))
            .times(1)
            .returning(|_, _| Ok(true));
        let cache = MockCacheBackend::new();

        let tier = select_tier(false, Arc::new(backend), Arc::new(cache));
        assert_eq!(tier.name(), "durable");
        assert_eq!(tier.replace(&entry(), 60).await.expect("merge"), 4);
        tier.delete("sessions", "s-1").await.expect("delete");
    }
}
