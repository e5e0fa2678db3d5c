//! Client access-time bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pending touch collected between two flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAccess {
    pub last_access_at: DateTime<Utc>,
    /// Set when at least one touch was a user logon through the client.
    pub logon: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Persisted access times of one client.
pub struct ClientAccessRecord {
    pub client_id: String,
    pub last_access_at: Option<DateTime<Utc>>,
    pub last_logon_at: Option<DateTime<Utc>>,
}

impl ClientAccessRecord {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            last_access_at: None,
            last_logon_at: None,
        }
    }

    pub fn apply(&mut self, access: ClientAccess) {
        if self.last_access_at.map_or(true, |at| at < access.last_access_at) {
            self.last_access_at = Some(access.last_access_at);
        }
        if access.logon && self.last_logon_at.map_or(true, |at| at < access.last_access_at) {
            self.last_logon_at = Some(access.last_access_at);
        }
    }
}
