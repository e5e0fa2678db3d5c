//! Storage collaborators: the durable tier, the expiring cache tier, and the
//! strategy that picks one of them for an entity kind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::StoreError;

pub mod memory;
pub mod postgres;
pub mod redis;
pub mod tier;

pub use tier::{select_tier, CacheTier, DurableTier, StorageTier};

/// Partitions (base DNs) used by the engine.
pub mod partitions {
    pub const SESSIONS: &str = "sessions";
    pub const TOKENS: &str = "tokens";
    pub const CLIENTS: &str = "clients";
    pub const CONFIGURATION: &str = "configuration";
}

/// Entity kinds stored in the partitions.
pub mod kinds {
    pub const SESSION: &str = "session";
    pub const TOKEN: &str = "token";
    pub const CLIENT_ACCESS: &str = "client_access";
    pub const KEY_SET: &str = "key_set";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Storage envelope around one entity.
pub struct StoredEntry {
    pub partition: String,
    pub kind: String,
    pub key: String,
    /// Marks the entry as eligible for the expiry sweep.
    pub deleted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub attributes: serde_json::Value,
    /// Optimistic concurrency counter maintained by the durable tier.
    pub version: i64,
}

impl StoredEntry {
    pub fn encode<T: Serialize>(
        partition: &str,
        kind: &str,
        key: &str,
        entity: &T,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            partition: partition.to_string(),
            kind: kind.to_string(),
            key: key.to_string(),
            deleted: false,
            expires_at: None,
            attributes: serde_json::to_value(entity)?,
            version: 0,
        })
    }

    pub fn with_expiration(mut self, deleted: bool, expires_at: Option<DateTime<Utc>>) -> Self {
        self.deleted = deleted;
        self.expires_at = expires_at;
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.attributes.clone())?)
    }

    pub fn cache_key(&self) -> String {
        cache_key(&self.partition, &self.key)
    }

    /// Top-level string attribute, used by equality filters.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|value| value.as_str())
    }
}

pub fn cache_key(partition: &str, key: &str) -> String {
    format!("{}:{}", partition, key)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Top-level string attribute equals the value.
    Equals { attribute: String, value: String },
    /// Entry carries the sweep marker.
    Deleted(bool),
    /// Entry expires at or before the instant.
    ExpiresAtOrBefore(DateTime<Utc>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn equals(attribute: &str, value: &str) -> Self {
        Filter::Equals {
            attribute: attribute.to_string(),
            value: value.to_string(),
        }
    }

    /// `deleted = true AND expires_at <= now`.
    pub fn expired(now: DateTime<Utc>) -> Self {
        Filter::And(vec![Filter::Deleted(true), Filter::ExpiresAtOrBefore(now)])
    }

    pub fn matches(&self, entry: &StoredEntry) -> bool {
        match self {
            Filter::Equals { attribute, value } => entry.attribute(attribute) == Some(value),
            Filter::Deleted(flag) => entry.deleted == *flag,
            Filter::ExpiresAtOrBefore(at) => matches!(entry.expires_at, Some(exp) if exp <= *at),
            Filter::And(filters) => filters.iter().all(|filter| filter.matches(entry)),
        }
    }
}

/// Durable tier (directory or database).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn find(&self, partition: &str, key: &str) -> Result<Option<StoredEntry>, StoreError>;

    async fn find_entries(
        &self,
        partition: &str,
        kind: &str,
        filter: &Filter,
    ) -> Result<Vec<StoredEntry>, StoreError>;

    /// Inserts a new entry and returns its version.
    async fn persist(&self, entry: &StoredEntry) -> Result<i64, StoreError>;

    /// Replaces an existing entry whose version still matches and returns the new version.
    async fn merge(&self, entry: &StoredEntry) -> Result<i64, StoreError>;

    async fn remove(&self, partition: &str, key: &str) -> Result<bool, StoreError>;

    /// Removes at most `limit` entries matching the filter.
    async fn remove_by_filter(
        &self,
        partition: &str,
        kind: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<u64, StoreError>;

    fn has_native_expiration_support(&self, partition: &str) -> bool;
}

/// Fast expiring cache tier.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn put(&self, key: &str, entry: &StoredEntry, ttl_seconds: u64)
        -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Evicts expired entries for caches that do not expire them on their own.
    async fn cleanup_expired(&self) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(deleted: bool, expires_at: Option<DateTime<Utc>>) -> StoredEntry {
        StoredEntry::encode(
            partitions::TOKENS,
            kinds::TOKEN,
            "abc",
            &serde_json::json!({ "grant_id": "g-1", "client_id": "rp" }),
        )
        .expect("encode")
        .with_expiration(deleted, expires_at)
    }

    #[test]
    fn expired_filter_requires_both_marker_and_expiry() {
        let now = Utc::now();
        let filter = Filter::expired(now);
        assert!(filter.matches(&entry(true, Some(now - Duration::seconds(1)))));
        assert!(filter.matches(&entry(true, Some(now))));
        assert!(!filter.matches(&entry(false, Some(now - Duration::seconds(1)))));
        assert!(!filter.matches(&entry(true, Some(now + Duration::seconds(1)))));
        assert!(!filter.matches(&entry(true, None)));
    }

    #[test]
    fn equality_filter_reads_top_level_attributes() {
        let entry = entry(true, None);
        assert!(Filter::equals("grant_id", "g-1").matches(&entry));
        assert!(!Filter::equals("grant_id", "g-2").matches(&entry));
        assert!(!Filter::equals("missing", "g-1").matches(&entry));
    }

    #[test]
    fn cache_key_joins_partition_and_key() {
        assert_eq!(entry(true, None).cache_key(), "tokens:abc");
    }
}
