//! Session persistence across the configured storage tier and a short-lived
//! process-local cache.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use moka::future::Cache;

use crate::error::{SessionError, StoreError};
use crate::models::session::{Session, SessionIdState};
use crate::persistence::{kinds, partitions, Filter, PersistenceBackend, StorageTier, StoredEntry};
use crate::services::session_events::{notify, SessionEvent, SessionEventListener, SessionEventType};
use crate::services::session_policy::SessionLifetimes;
use crate::types::{OutsideSessionId, SessionId};

pub const MAX_MERGE_ATTEMPTS: u32 = 3;
pub const LOCAL_CACHE_TTL: StdDuration = StdDuration::from_secs(2);
/// `last_used_at` is only rewritten when it moved by more than this.
pub const LAST_USED_AT_RESOLUTION_MS: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    pub update_last_used_at: bool,
    pub force_update: bool,
    pub modified: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            update_last_used_at: true,
            force_update: false,
            modified: true,
        }
    }
}

impl UpdateOptions {
    /// Touch and write regardless of prompt or lifetime settings.
    pub fn forced() -> Self {
        Self {
            update_last_used_at: true,
            force_update: true,
            modified: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Written,
    /// Nothing changed enough to be worth a write.
    Unchanged,
    /// Persistence is disabled for this session (lifetime or `prompt=none`).
    NotPersisted,
    /// The session was past one of its lifetimes and has been removed.
    Removed,
}

impl UpdateOutcome {
    /// Whether the session is still usable after the call.
    pub fn is_live(self) -> bool {
        self != UpdateOutcome::Removed
    }
}

pub struct SessionStore {
    tier: Arc<dyn StorageTier>,
    durable: Arc<dyn PersistenceBackend>,
    local: Cache<String, Session>,
    lifetimes: SessionLifetimes,
    events: Arc<dyn SessionEventListener>,
}

impl SessionStore {
    pub fn new(
        tier: Arc<dyn StorageTier>,
        durable: Arc<dyn PersistenceBackend>,
        lifetimes: SessionLifetimes,
        events: Arc<dyn SessionEventListener>,
    ) -> Self {
        Self {
            tier,
            durable,
            local: Cache::builder().time_to_live(LOCAL_CACHE_TTL).build(),
            lifetimes,
            events,
        }
    }

    pub fn lifetimes(&self) -> &SessionLifetimes {
        &self.lifetimes
    }

    pub fn events(&self) -> &dyn SessionEventListener {
        self.events.as_ref()
    }

    fn encode(&self, session: &Session) -> Result<StoredEntry, StoreError> {
        Ok(StoredEntry::encode(
            partitions::SESSIONS,
            kinds::SESSION,
            &session.id.to_string(),
            session,
        )?
        .with_expiration(session.deleted, Some(session.expiration_date))
        .with_version(session.version))
    }

    fn decode(entry: &StoredEntry) -> Result<Session, StoreError> {
        let mut session: Session = entry.decode()?;
        session.persisted = true;
        session.version = entry.version;
        Ok(session)
    }

    fn ttl(session: &Session) -> u64 {
        session.ttl.max(0) as u64
    }

    /// Looks a session up, local cache first. Lookup failures are logged and
    /// reported as not found.
    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        let key = id.to_string();
        if let Some(local) = self.local.get(&key).await {
            if self.lifetimes.is_valid(&local, Utc::now()) {
                return Some(local);
            }
            tracing::trace!(session_id = %id, "Evicting invalid session from local cache");
            self.local.invalidate(&key).await;
        }

        let entry = match self.tier.load(partitions::SESSIONS, &key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tracing::trace!(session_id = %id, tier = self.tier.name(), "Session not found");
                return None;
            }
            Err(err) => {
                tracing::error!(session_id = %id, "Failed to get session: {}", err);
                return None;
            }
        };

        match Self::decode(&entry) {
            Ok(session) => {
                self.local.insert(key, session.clone()).await;
                Some(session)
            }
            Err(err) => {
                tracing::error!(session_id = %id, "Failed to decode session: {}", err);
                None
            }
        }
    }

    /// First write of a session. Returns `false` when persistence is not
    /// enabled for it or the write failed.
    pub async fn create(&self, session: &mut Session, force: bool) -> bool {
        if !self.lifetimes.persistence_enabled(&session.prompts(), force) {
            tracing::trace!(session_id = %session.id, "Session persistence skipped");
            return false;
        }

        session.last_used_at = Some(Utc::now());
        let (expiration_date, ttl) = self.lifetimes.expiration(session.created_at, session.state);
        session.expiration_date = expiration_date;
        session.ttl = ttl;

        let entry = match self.encode(session) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(session_id = %session.id, "Failed to encode session: {}", err);
                return false;
            }
        };
        match self.tier.insert(&entry, Self::ttl(session)).await {
            Ok(version) => {
                session.version = version;
                session.persisted = true;
            }
            Err(err) => {
                tracing::error!(session_id = %session.id, "Failed to persist session: {}", err);
                return false;
            }
        }

        self.local
            .insert(session.id.to_string(), session.clone())
            .await;
        let event_type = match session.state {
            SessionIdState::Authenticated => SessionEventType::Authenticated,
            SessionIdState::Unauthenticated => SessionEventType::Unauthenticated,
        };
        notify(self.events.as_ref(), SessionEvent::new(event_type, session));
        true
    }

    /// Touches and rewrites a session. Conflicting durable writes are retried;
    /// any other storage failure, or running out of attempts, is returned.
    pub async fn update(
        &self,
        session: &mut Session,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome, SessionError> {
        if !self
            .lifetimes
            .persistence_enabled(&session.prompts(), options.force_update)
        {
            return Ok(UpdateOutcome::NotPersisted);
        }

        let now = Utc::now();
        let mut write = options.modified;

        if options.update_last_used_at {
            match session.last_used_at {
                Some(last_used_at) => {
                    if self.lifetimes.is_unused_too_long(last_used_at, now) {
                        tracing::debug!(session_id = %session.id, "Session expired by unused lifetime, removing");
                        self.remove(session).await;
                        return Ok(UpdateOutcome::Removed);
                    }
                    if (now - last_used_at).num_milliseconds() > LAST_USED_AT_RESOLUTION_MS {
                        session.touch(now);
                        write = true;
                    }
                }
                None => {
                    session.touch(now);
                    write = true;
                }
            }
        }

        if !session.persisted {
            write = true;
        }

        if self.lifetimes.is_expired(session, now) {
            tracing::debug!(session_id = %session.id, "Session expired by server lifetime, removing");
            self.remove(session).await;
            return Ok(UpdateOutcome::Removed);
        }

        if !write {
            return Ok(UpdateOutcome::Unchanged);
        }

        self.write_with_retry(session).await?;
        Ok(UpdateOutcome::Written)
    }

    async fn write_with_retry(&self, session: &mut Session) -> Result<(), SessionError> {
        let (expiration_date, ttl) = self.lifetimes.expiration(session.created_at, session.state);
        session.expiration_date = expiration_date;
        session.ttl = ttl;

        let key = session.id.to_string();
        let mut insert = !session.persisted;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let entry = self.encode(session)?;
            let written = if insert {
                self.tier.insert(&entry, Self::ttl(session)).await
            } else {
                self.tier.replace(&entry, Self::ttl(session)).await
            };

            match written {
                Ok(version) => {
                    session.version = version;
                    session.persisted = true;
                    break;
                }
                Err(err) if err.retryable_conflict() && attempt < MAX_MERGE_ATTEMPTS => {
                    tracing::warn!(
                        session_id = %session.id,
                        attempt,
                        "Session entry update attempt was unsuccessful: {}",
                        err
                    );
                    match self.tier.load(partitions::SESSIONS, &key).await? {
                        Some(current) => {
                            session.version = current.version;
                            insert = false;
                        }
                        None => insert = true,
                    }
                }
                Err(err) if err.retryable_conflict() => {
                    tracing::error!(
                        session_id = %session.id,
                        "Session entry update was unsuccessful after {} attempts",
                        attempt
                    );
                    return Err(SessionError::RetriesExhausted { attempts: attempt, last: err });
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.local.insert(key, session.clone()).await;
        notify(
            self.events.as_ref(),
            SessionEvent::new(SessionEventType::Updated, session),
        );
        Ok(())
    }

    /// Deletes a session from its tier and the local cache. Never fails.
    pub async fn remove(&self, session: &Session) -> bool {
        let key = session.id.to_string();
        if let Err(err) = self.tier.delete(partitions::SESSIONS, &key).await {
            tracing::error!(session_id = %session.id, "Failed to remove session: {}", err);
            return false;
        }
        self.local.invalidate(&key).await;
        notify(
            self.events.as_ref(),
            SessionEvent::new(SessionEventType::Gone, session),
        );
        true
    }

    pub async fn remove_all(&self, sessions: &[Session]) {
        for session in sessions {
            self.remove(session).await;
        }
    }

    fn ensure_queryable(&self, operation: &str) -> Result<(), StoreError> {
        if self.tier.supports_queries() {
            Ok(())
        } else {
            Err(StoreError::Unsupported(format!(
                "{} is not supported while sessions are persisted in cache",
                operation
            )))
        }
    }

    async fn find_by(&self, attribute: &str, value: &str) -> Result<Vec<Session>, StoreError> {
        self.durable
            .find_entries(
                partitions::SESSIONS,
                kinds::SESSION,
                &Filter::equals(attribute, value),
            )
            .await?
            .iter()
            .map(Self::decode)
            .collect()
    }

    pub async fn find_by_user(&self, user_dn: &str) -> Result<Vec<Session>, StoreError> {
        self.ensure_queryable("find_by_user")?;
        self.find_by("user_dn", user_dn).await
    }

    /// Session exposed to the browser under `sid`; `None` unless exactly one matches.
    pub async fn find_by_sid(&self, sid: &OutsideSessionId) -> Result<Option<Session>, StoreError> {
        self.ensure_queryable("find_by_sid")?;
        let mut sessions = self.find_by("outside_sid", &sid.to_string()).await?;
        if sessions.len() == 1 {
            Ok(sessions.pop())
        } else {
            Ok(None)
        }
    }
}
