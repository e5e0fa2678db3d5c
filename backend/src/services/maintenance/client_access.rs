//! Debounced client access-time updates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::MaintenanceTask;
use crate::error::StoreError;
use crate::models::client_access::{ClientAccess, ClientAccessRecord};
use crate::persistence::{kinds, partitions, PersistenceBackend, StoredEntry};

/// Collects access touches from request handling between two flushes.
#[derive(Debug, Default)]
pub struct ClientAccessTracker {
    pending: DashMap<String, ClientAccess>,
}

impl ClientAccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, client_id: &str, logon: bool) {
        self.touch_at(client_id, logon, Utc::now());
    }

    pub fn touch_at(&self, client_id: &str, logon: bool, at: DateTime<Utc>) {
        self.pending
            .entry(client_id.to_string())
            .and_modify(|access| {
                access.last_access_at = access.last_access_at.max(at);
                access.logon |= logon;
            })
            .or_insert(ClientAccess {
                last_access_at: at,
                logon,
            });
    }

    /// Takes every pending touch. Touches made while draining stay queued
    /// for the next flush.
    pub fn drain(&self) -> Vec<(String, ClientAccess)> {
        let client_ids: Vec<String> = self.pending.iter().map(|item| item.key().clone()).collect();
        client_ids
            .into_iter()
            .filter_map(|client_id| self.pending.remove(&client_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

pub struct ClientAccessFlush {
    tracker: Arc<ClientAccessTracker>,
    durable: Arc<dyn PersistenceBackend>,
    interval: Duration,
}

impl ClientAccessFlush {
    pub fn new(
        tracker: Arc<ClientAccessTracker>,
        durable: Arc<dyn PersistenceBackend>,
        interval: Duration,
    ) -> Self {
        Self {
            tracker,
            durable,
            interval,
        }
    }

    pub async fn load(&self, client_id: &str) -> Result<Option<ClientAccessRecord>, StoreError> {
        match self.durable.find(partitions::CLIENTS, client_id).await? {
            Some(entry) => Ok(Some(entry.decode()?)),
            None => Ok(None),
        }
    }

    async fn write(&self, client_id: &str, access: ClientAccess) -> Result<(), StoreError> {
        let existing = self.durable.find(partitions::CLIENTS, client_id).await?;
        let (mut record, version) = match &existing {
            Some(entry) => (entry.decode::<ClientAccessRecord>()?, entry.version),
            None => (ClientAccessRecord::new(client_id), 0),
        };
        record.apply(access);

        let entry = StoredEntry::encode(partitions::CLIENTS, kinds::CLIENT_ACCESS, client_id, &record)?
            .with_version(version);
        if existing.is_some() {
            self.durable.merge(&entry).await?;
        } else {
            self.durable.persist(&entry).await?;
        }
        Ok(())
    }

    /// Writes every pending touch once. Returns how many clients were updated.
    pub async fn flush(&self) -> usize {
        let pending = self.tracker.drain();
        let mut written = 0;
        for (client_id, access) in pending {
            match self.write(&client_id, access).await {
                Ok(()) => written += 1,
                Err(err) => {
                    tracing::error!(client_id = %client_id, "Failed to update client access time: {}", err)
                }
            }
        }
        written
    }
}

#[async_trait]
impl MaintenanceTask for ClientAccessFlush {
    fn name(&self) -> &'static str {
        "client_access_flush"
    }

    fn min_interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> anyhow::Result<()> {
        let written = self.flush().await;
        if written > 0 {
            tracing::debug!(written, "Flushed client access times");
        }
        Ok(())
    }
}
