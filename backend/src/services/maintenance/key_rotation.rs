//! Signing key rotation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::MaintenanceTask;
use crate::config::Config;
use crate::models::key_set::KeySetDocument;
use crate::repositories::key_set_store::KeySetStore;
use crate::services::key_rotator::CryptoKeyRotator;

pub struct KeyRotation {
    store: KeySetStore,
    rotator: Arc<dyn CryptoKeyRotator>,
    algs: Vec<String>,
    /// Rotation period in hours.
    interval_hours: u64,
    /// Seconds a token signed just before rotation stays valid.
    max_token_lifetime: i64,
}

impl KeyRotation {
    pub fn new(
        store: KeySetStore,
        rotator: Arc<dyn CryptoKeyRotator>,
        algs: Vec<String>,
        interval_hours: u64,
        max_token_lifetime: i64,
    ) -> Self {
        Self {
            store,
            rotator,
            algs,
            interval_hours,
            max_token_lifetime,
        }
    }

    pub fn from_config(config: &Config, store: KeySetStore, rotator: Arc<dyn CryptoKeyRotator>) -> Self {
        Self::new(
            store,
            rotator,
            config.key_algs_allowed_for_generation.clone(),
            config.key_regeneration_interval,
            config.max_token_lifetime(),
        )
    }

    fn next_expiration(&self, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
        let interval = i64::try_from(self.interval_hours)
            .ok()
            .and_then(ChronoDuration::try_hours);
        let token_lifetime = ChronoDuration::try_seconds(self.max_token_lifetime);
        interval
            .zip(token_lifetime)
            .and_then(|(interval, token_lifetime)| {
                now.checked_add_signed(interval)?
                    .checked_add_signed(token_lifetime)
            })
            .ok_or_else(|| {
                anyhow!(
                    "key expiration out of range: {} hours plus {} seconds",
                    self.interval_hours,
                    self.max_token_lifetime
                )
            })
    }

    /// Replaces the key set with freshly generated keys plus the old keys
    /// that are still usable. Expired keys are destroyed; keys without an
    /// expiration get one.
    pub async fn rotate(&self, now: DateTime<Utc>) -> anyhow::Result<KeySetDocument> {
        let (current, version) = self.store.load().await.context("load key set")?;
        let expiration = self.next_expiration(now)?;
        let mut next = self
            .rotator
            .generate_key_set(&self.algs, expiration)
            .await
            .context("generate key set")?;

        for mut key in current.keys {
            match key.exp {
                Some(_) if key.is_expired_at(now) => {
                    match self.rotator.delete_key(&key.kid).await {
                        Ok(_) => tracing::debug!(kid = %key.kid, "Deleted expired key"),
                        Err(err) => tracing::warn!(kid = %key.kid, "Failed to delete expired key: {:#}", err),
                    }
                }
                Some(_) => {
                    if self.rotator.contains_key(&key.kid).await? {
                        next.keys.push(key);
                    }
                }
                None => {
                    if self.rotator.contains_key(&key.kid).await? {
                        key.exp = Some(expiration);
                        next.keys.push(key);
                    }
                }
            }
        }

        next.revision = current.revision + 1;
        self.store.save(&next, version).await.context("save key set")?;
        tracing::info!(revision = next.revision, keys = next.keys.len(), "Rotated signing keys");
        Ok(next)
    }
}

#[async_trait]
impl MaintenanceTask for KeyRotation {
    fn name(&self) -> &'static str {
        "key_rotation"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.saturating_mul(3_600))
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.rotate(Utc::now()).await.map(|_| ())
    }
}
