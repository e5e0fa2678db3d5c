use std::sync::Arc;

use crate::error::StoreError;
use crate::models::key_set::KeySetDocument;
use crate::persistence::{kinds, partitions, PersistenceBackend, StoredEntry};

pub const KEY_SET_KEY: &str = "jwks";

/// The signing key-set document, kept in the durable tier.
pub struct KeySetStore {
    durable: Arc<dyn PersistenceBackend>,
}

impl KeySetStore {
    pub fn new(durable: Arc<dyn PersistenceBackend>) -> Self {
        Self { durable }
    }

    /// Current document and its storage version; an empty document at
    /// version 0 when none was stored yet.
    pub async fn load(&self) -> Result<(KeySetDocument, i64), StoreError> {
        match self.durable.find(partitions::CONFIGURATION, KEY_SET_KEY).await? {
            Some(entry) => Ok((entry.decode()?, entry.version)),
            None => Ok((KeySetDocument::default(), 0)),
        }
    }

    /// Writes `document` over the version previously returned by `load`.
    pub async fn save(&self, document: &KeySetDocument, version: i64) -> Result<i64, StoreError> {
        let entry = StoredEntry::encode(
            partitions::CONFIGURATION,
            kinds::KEY_SET,
            KEY_SET_KEY,
            document,
        )?
        .with_version(version);
        if version == 0 {
            self.durable.persist(&entry).await
        } else {
            self.durable.merge(&entry).await
        }
    }
}
