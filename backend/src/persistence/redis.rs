use async_trait::async_trait;
use bb8_redis::redis::AsyncCommands;
use tracing::Instrument;

use super::{CacheBackend, StoredEntry};
use crate::db::redis::RedisPool;
use crate::error::StoreError;

/// Cache tier backed by Redis. Entries expire natively through `SET EX`.
pub struct RedisCache {
    pool: RedisPool,
}

impl RedisCache {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    async fn connection(
        &self,
    ) -> Result<bb8::PooledConnection<'_, bb8_redis::RedisConnectionManager>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|err| StoreError::Cache(err.to_string()))
    }
}

fn cache_error(err: bb8_redis::redis::RedisError) -> StoreError {
    StoreError::Cache(err.to_string())
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn put(
        &self,
        key: &str,
        entry: &StoredEntry,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let span = tracing::debug_span!("redis_cache_put", key, ttl_seconds);
        async {
            let mut conn = self.connection().await?;
            if ttl_seconds == 0 {
                // Redis rejects a zero expiry; such an entry is already gone.
                conn.del::<_, ()>(key).await.map_err(cache_error)?;
                return Ok(());
            }
            let payload = serde_json::to_string(entry)?;
            conn.set_ex::<_, _, ()>(key, payload, ttl_seconds)
                .await
                .map_err(cache_error)
        }
        .instrument(span)
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let span = tracing::debug_span!("redis_cache_get", key);
        async {
            let mut conn = self.connection().await?;
            let payload: Option<String> = conn.get(key).await.map_err(cache_error)?;
            payload
                .map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
                .transpose()
        }
        .instrument(span)
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let span = tracing::debug_span!("redis_cache_remove", key);
        async {
            let mut conn = self.connection().await?;
            conn.del::<_, ()>(key).await.map_err(cache_error)
        }
        .instrument(span)
        .await
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        Ok(0)
    }
}
