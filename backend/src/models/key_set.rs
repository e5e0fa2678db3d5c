//! Signing key-set document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kid: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    /// Keys without expiration are assigned one on the next rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<DateTime<Utc>>,
}

impl JsonWebKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.exp, Some(exp) if exp <= now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySetDocument {
    /// Incremented on every persisted rotation.
    pub revision: u64,
    pub keys: Vec<JsonWebKey>,
}

impl KeySetDocument {
    pub fn key(&self, kid: &str) -> Option<&JsonWebKey> {
        self.keys.iter().find(|key| key.kid == kid)
    }

    pub fn kids(&self) -> Vec<&str> {
        self.keys.iter().map(|key| key.kid.as_str()).collect()
    }
}
