//! Session lifetime rules derived once from configuration.

use chrono::{DateTime, Duration, Utc};

use crate::config::{Config, DEFAULT_SESSION_ID_LIFETIME};
use crate::models::session::{Prompt, Session, SessionIdState};

/// Lifetime value meaning "never expires".
pub const UNBOUNDED: i64 = -1;

/// Sentinel used when no positive session lifetime is configured at all.
pub const UNBOUNDED_SERVER_LIFETIME: i64 = i32::MAX as i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLifetimes {
    /// Seconds a session may sit unused; `-1` for unbounded, `0` disables persistence.
    pub unused_lifetime: i64,
    /// Seconds an unauthenticated session may sit unused; `-1` for unbounded.
    pub unauthenticated_unused_lifetime: i64,
    /// Hard lifetime of an authenticated session, in seconds.
    pub server_lifetime: i64,
    pub persist_on_prompt_none: bool,
}

impl SessionLifetimes {
    pub fn from_config(config: &Config) -> Self {
        Self {
            unused_lifetime: config.session_id_unused_lifetime,
            unauthenticated_unused_lifetime: config.session_id_unauthenticated_unused_lifetime,
            server_lifetime: resolve_server_lifetime(
                config.server_session_id_lifetime,
                config.session_id_lifetime,
            ),
            persist_on_prompt_none: config.session_id_persist_on_prompt_none,
        }
    }

    /// Seconds until a session in `state` expires from the storage tier.
    pub fn expiration_seconds(&self, state: SessionIdState) -> i64 {
        match state {
            SessionIdState::Unauthenticated => self.unauthenticated_unused_lifetime,
            SessionIdState::Authenticated => self.server_lifetime,
        }
    }

    /// Expiration instant and ttl for a session created at `created_at`.
    pub fn expiration(&self, created_at: DateTime<Utc>, state: SessionIdState) -> (DateTime<Utc>, i64) {
        let seconds = match self.expiration_seconds(state) {
            UNBOUNDED => UNBOUNDED_SERVER_LIFETIME,
            seconds => seconds,
        };
        let expires_at = Duration::try_seconds(seconds)
            .and_then(|lifetime| created_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (expires_at, seconds)
    }

    /// Idle checks. The unauthenticated lifetime applies even when the general
    /// lifetime is unbounded.
    pub fn is_valid(&self, session: &Session, now: DateTime<Utc>) -> bool {
        let idle = match session.last_used_at {
            Some(last_used_at) => now - last_used_at,
            None => return true,
        };
        if self.unused_lifetime != UNBOUNDED && exceeds(idle, self.unused_lifetime) {
            return false;
        }
        session.state != SessionIdState::Unauthenticated
            || self.unauthenticated_unused_lifetime == UNBOUNDED
            || !exceeds(idle, self.unauthenticated_unused_lifetime)
    }

    /// Hard lifetime check, counted from authentication time.
    pub fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        match session.authentication_time {
            Some(authenticated_at) => {
                (now - authenticated_at).num_seconds() > self.server_lifetime
            }
            None => false,
        }
    }

    /// Whether the idle time since `last_used_at` exceeds the unused lifetime.
    pub fn is_unused_too_long(&self, last_used_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.unused_lifetime != UNBOUNDED
            && (now - last_used_at).num_seconds() > self.unused_lifetime
    }

    pub fn persistence_enabled(&self, prompts: &[Prompt], force: bool) -> bool {
        if force {
            return true;
        }
        if self.unused_lifetime == 0 {
            return false;
        }
        !prompts.contains(&Prompt::None) || self.persist_on_prompt_none
    }
}

/// Lifetimes too large for a `Duration` never run out.
fn exceeds(idle: Duration, seconds: i64) -> bool {
    Duration::try_seconds(seconds).is_some_and(|lifetime| idle > lifetime)
}

pub fn resolve_server_lifetime(server: Option<i64>, session: Option<i64>) -> i64 {
    match (server, session) {
        (Some(server), _) if server > 0 => server,
        (_, Some(session)) if session > 0 => session,
        (Some(_), Some(_)) => UNBOUNDED_SERVER_LIFETIME,
        _ => DEFAULT_SESSION_ID_LIFETIME,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutsideSessionId, SessionId};
    use std::collections::BTreeMap;

    fn lifetimes() -> SessionLifetimes {
        SessionLifetimes {
            unused_lifetime: 86_400,
            unauthenticated_unused_lifetime: 600,
            server_lifetime: 3_600,
            persist_on_prompt_none: false,
        }
    }

    fn session(state: SessionIdState, last_used_at: DateTime<Utc>) -> Session {
        Session {
            id: SessionId::new(),
            outside_sid: OutsideSessionId::new(),
            session_state: String::new(),
            state,
            user_dn: None,
            attributes: BTreeMap::new(),
            permission_granted: BTreeMap::new(),
            created_at: last_used_at,
            authentication_time: None,
            last_used_at: Some(last_used_at),
            expiration_date: last_used_at,
            ttl: 0,
            deleted: true,
            client: None,
            persisted: false,
            version: 0,
        }
    }

    #[test]
    fn server_lifetime_fallbacks() {
        assert_eq!(resolve_server_lifetime(Some(100), Some(50)), 100);
        assert_eq!(resolve_server_lifetime(Some(0), Some(50)), 50);
        assert_eq!(resolve_server_lifetime(Some(0), Some(-1)), UNBOUNDED_SERVER_LIFETIME);
        assert_eq!(resolve_server_lifetime(None, None), DEFAULT_SESSION_ID_LIFETIME);
        assert_eq!(resolve_server_lifetime(None, Some(0)), DEFAULT_SESSION_ID_LIFETIME);
    }

    #[test]
    fn unauthenticated_session_goes_invalid_after_its_own_lifetime() {
        let t0 = Utc::now();
        let session = session(SessionIdState::Unauthenticated, t0);
        let policy = lifetimes();
        assert!(policy.is_valid(&session, t0 + Duration::seconds(500)));
        assert!(!policy.is_valid(&session, t0 + Duration::seconds(700)));
    }

    #[test]
    fn authenticated_session_uses_general_lifetime_only() {
        let t0 = Utc::now();
        let session = session(SessionIdState::Authenticated, t0);
        let policy = lifetimes();
        assert!(policy.is_valid(&session, t0 + Duration::seconds(700)));
        assert!(!policy.is_valid(&session, t0 + Duration::seconds(86_401)));
    }

    #[test]
    fn unauthenticated_check_applies_when_general_lifetime_unbounded() {
        let t0 = Utc::now();
        let policy = SessionLifetimes {
            unused_lifetime: UNBOUNDED,
            ..lifetimes()
        };
        let unauthenticated = session(SessionIdState::Unauthenticated, t0);
        let authenticated = session(SessionIdState::Authenticated, t0);
        let later = t0 + Duration::days(30);
        assert!(!policy.is_valid(&unauthenticated, later));
        assert!(policy.is_valid(&authenticated, later));

        let policy = SessionLifetimes {
            unauthenticated_unused_lifetime: UNBOUNDED,
            ..policy
        };
        assert!(policy.is_valid(&unauthenticated, later));
    }

    #[test]
    fn expiry_counts_from_authentication_time() {
        let t0 = Utc::now();
        let mut session = session(SessionIdState::Authenticated, t0);
        let policy = lifetimes();
        assert!(!policy.is_expired(&session, t0 + Duration::hours(5)));
        session.authentication_time = Some(t0);
        assert!(!policy.is_expired(&session, t0 + Duration::seconds(3_600)));
        assert!(policy.is_expired(&session, t0 + Duration::seconds(3_601)));
    }

    #[test]
    fn expiration_depends_on_state() {
        let t0 = Utc::now();
        let policy = lifetimes();
        let (at, ttl) = policy.expiration(t0, SessionIdState::Unauthenticated);
        assert_eq!(ttl, 600);
        assert_eq!(at, t0 + Duration::seconds(600));
        let (_, ttl) = policy.expiration(t0, SessionIdState::Authenticated);
        assert_eq!(ttl, 3_600);
    }

    #[test]
    fn oversized_lifetimes_do_not_overflow() {
        let t0 = Utc::now();
        let policy = SessionLifetimes {
            unused_lifetime: i64::MAX,
            unauthenticated_unused_lifetime: i64::MAX,
            server_lifetime: i64::MAX,
            persist_on_prompt_none: false,
        };
        let (at, ttl) = policy.expiration(t0, SessionIdState::Authenticated);
        assert_eq!(ttl, i64::MAX);
        assert_eq!(at, DateTime::<Utc>::MAX_UTC);
        let session = session(SessionIdState::Unauthenticated, t0);
        assert!(policy.is_valid(&session, t0 + Duration::days(365)));
    }

    #[test]
    fn prompt_none_requires_opt_in() {
        let policy = lifetimes();
        assert!(policy.persistence_enabled(&[Prompt::Login], false));
        assert!(!policy.persistence_enabled(&[Prompt::None], false));
        assert!(policy.persistence_enabled(&[Prompt::None], true));
        let policy = SessionLifetimes {
            persist_on_prompt_none: true,
            ..policy
        };
        assert!(policy.persistence_enabled(&[Prompt::None], false));
    }

    #[test]
    fn zero_unused_lifetime_disables_persistence() {
        let policy = SessionLifetimes {
            unused_lifetime: 0,
            ..lifetimes()
        };
        assert!(!policy.persistence_enabled(&[], false));
        assert!(policy.persistence_enabled(&[], true));
        let unbounded = SessionLifetimes {
            unused_lifetime: UNBOUNDED,
            ..lifetimes()
        };
        assert!(unbounded.persistence_enabled(&[], false));
    }
}
