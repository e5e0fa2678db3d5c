//! Process-local backends used when no database or Redis URL is configured,
//! and by the test suites.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{cache_key, CacheBackend, Filter, PersistenceBackend, StoredEntry};
use crate::error::{ConflictKind, StoreError};

#[derive(Default)]
pub struct InMemoryPersistence {
    entries: DashMap<String, StoredEntry>,
    native_expiration: HashSet<String>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares partitions whose entries the backend expires on its own.
    pub fn with_native_expiration<I, S>(partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: DashMap::new(),
            native_expiration: partitions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn find(&self, partition: &str, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        Ok(self
            .entries
            .get(&cache_key(partition, key))
            .map(|entry| entry.value().clone()))
    }

    async fn find_entries(
        &self,
        partition: &str,
        kind: &str,
        filter: &Filter,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let mut found: Vec<StoredEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.partition == partition && entry.kind == kind)
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn persist(&self, entry: &StoredEntry) -> Result<i64, StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(entry.cache_key()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(ConflictKind::AttributeOrValueExists)),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone().with_version(1));
                Ok(1)
            }
        }
    }

    async fn merge(&self, entry: &StoredEntry) -> Result<i64, StoreError> {
        let mut current = self
            .entries
            .get_mut(&entry.cache_key())
            .ok_or_else(|| StoreError::NotFound(entry.cache_key()))?;
        if current.version != entry.version {
            return Err(StoreError::Conflict(ConflictKind::NoSuchAttribute));
        }
        let version = entry.version + 1;
        *current = entry.clone().with_version(version);
        Ok(version)
    }

    async fn remove(&self, partition: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(&cache_key(partition, key)).is_some())
    }

    async fn remove_by_filter(
        &self,
        partition: &str,
        kind: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let doomed = self.find_entries(partition, kind, filter).await?;
        let mut removed = 0;
        for entry in doomed.into_iter().take(limit) {
            if self.entries.remove(&entry.cache_key()).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn has_native_expiration_support(&self, partition: &str) -> bool {
        self.native_expiration.contains(partition)
    }
}

struct CachedValue {
    entry: StoredEntry,
    /// `None` when the ttl is beyond what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl CachedValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    values: DashMap<String, CachedValue>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn put(
        &self,
        key: &str,
        entry: &StoredEntry,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        self.values.insert(
            key.to_string(),
            CachedValue {
                entry: entry.clone(),
                expires_at: Instant::now().checked_add(Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let now = Instant::now();
        Ok(self
            .values
            .get(key)
            .filter(|value| value.is_live(now))
            .map(|value| value.entry.clone()))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let before = self.values.len();
        self.values.retain(|_, value| value.is_live(now));
        Ok(before.saturating_sub(self.values.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn entry(key: &str) -> StoredEntry {
        StoredEntry::encode("tokens", "token", key, &serde_json::json!({ "grant_id": "g" }))
            .expect("encode")
    }

    #[tokio::test]
    async fn merge_rejects_stale_version() {
        let store = InMemoryPersistence::new();
        let version = store.persist(&entry("a")).await.expect("persist");
        assert_eq!(version, 1);

        let fresh = entry("a").with_version(1);
        assert_eq!(store.merge(&fresh).await.expect("merge"), 2);

        let stale = entry("a").with_version(1);
        let err = store.merge(&stale).await.expect_err("stale write");
        assert!(err.retryable_conflict());
    }

    #[tokio::test]
    async fn persist_twice_reports_existing_value() {
        let store = InMemoryPersistence::new();
        store.persist(&entry("a")).await.expect("persist");
        let err = store.persist(&entry("a")).await.expect_err("duplicate");
        assert!(matches!(
            err,
            StoreError::Conflict(ConflictKind::AttributeOrValueExists)
        ));
    }

    #[tokio::test]
    async fn remove_by_filter_honours_limit() {
        let store = InMemoryPersistence::new();
        let past = Utc::now() - ChronoDuration::minutes(1);
        for key in ["a", "b", "c"] {
            store
                .persist(&entry(key).with_expiration(true, Some(past)))
                .await
                .expect("persist");
        }
        let filter = Filter::expired(Utc::now());
        assert_eq!(
            store
                .remove_by_filter("tokens", "token", &filter, 2)
                .await
                .expect("sweep"),
            2
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn cache_hides_and_evicts_expired_values() {
        let cache = InMemoryCache::new();
        cache.put("k", &entry("k"), 0).await.expect("put");
        cache.put("live", &entry("live"), 60).await.expect("put");
        assert!(cache.get("k").await.expect("get").is_none());
        assert!(cache.get("live").await.expect("get").is_some());
        assert_eq!(cache.cleanup_expired().await.expect("cleanup"), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn unrepresentable_ttl_never_expires() {
        let cache = InMemoryCache::new();
        cache.put("k", &entry("k"), u64::MAX).await.expect("put");
        assert!(cache.get("k").await.expect("get").is_some());
        assert_eq!(cache.cleanup_expired().await.expect("cleanup"), 0);
    }
}
