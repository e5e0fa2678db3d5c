//! Expired entry sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::MaintenanceTask;
use crate::config::{CleanTarget, Config};
use crate::persistence::{CacheBackend, Filter, PersistenceBackend};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<(CleanTarget, u64)>,
    /// Targets whose storage expires entries on its own.
    pub skipped: Vec<CleanTarget>,
    pub cache_removed: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.removed.iter().map(|(_, count)| count).sum::<u64>() + self.cache_removed
    }
}

pub struct ExpiredEntryCleaner {
    durable: Arc<dyn PersistenceBackend>,
    cache: Arc<dyn CacheBackend>,
    targets: Vec<CleanTarget>,
    batch_size: usize,
    interval: Duration,
}

impl ExpiredEntryCleaner {
    pub fn new(
        durable: Arc<dyn PersistenceBackend>,
        cache: Arc<dyn CacheBackend>,
        targets: Vec<CleanTarget>,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            durable,
            cache,
            targets,
            batch_size,
            interval,
        }
    }

    pub fn from_config(
        config: &Config,
        durable: Arc<dyn PersistenceBackend>,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        Self::new(
            durable,
            cache,
            config.clean_service_partitions.clone(),
            config.clean_service_batch_chunk_size,
            Duration::from_secs(config.clean_service_interval),
        )
    }

    /// Removes up to one batch of expired entries per target, then lets the
    /// cache drop its own expired values. Failures are logged per target.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut seen = HashSet::new();
        let filter = Filter::expired(now);

        for target in &self.targets {
            if !seen.insert(target) {
                continue;
            }
            if self.durable.has_native_expiration_support(&target.partition) {
                tracing::trace!(partition = %target.partition, "Storage expires entries natively, skipping");
                report.skipped.push(target.clone());
                continue;
            }

            match self
                .durable
                .remove_by_filter(&target.partition, &target.kind, &filter, self.batch_size)
                .await
            {
                Ok(removed) => {
                    if removed > 0 {
                        tracing::debug!(
                            partition = %target.partition,
                            kind = %target.kind,
                            removed,
                            "Removed expired entries"
                        );
                    }
                    report.removed.push((target.clone(), removed));
                }
                Err(err) => tracing::error!(
                    partition = %target.partition,
                    kind = %target.kind,
                    "Failed to remove expired entries: {}",
                    err
                ),
            }
        }

        match self.cache.cleanup_expired().await {
            Ok(removed) => report.cache_removed = removed,
            Err(err) => tracing::error!("Failed to clean up cache: {}", err),
        }
        report
    }
}

#[async_trait]
impl MaintenanceTask for ExpiredEntryCleaner {
    fn name(&self) -> &'static str {
        "cleaner"
    }

    fn min_interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> anyhow::Result<()> {
        let report = self.sweep(Utc::now()).await;
        tracing::debug!(removed = report.total(), "Expired entry sweep done");
        Ok(())
    }
}
