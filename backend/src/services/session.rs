//! Session lifecycle: generation, authentication, re-initialisation of the
//! login flow and step handling.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use url::Url;
use uuid::Uuid;

use crate::error::SessionError;
use crate::models::session::{attrs, Prompt, Session, SessionIdState};
use crate::repositories::session_store::{SessionStore, UpdateOptions, UpdateOutcome};
use crate::services::acr::{AcrCheck, AcrGuard};
use crate::services::session_events::{notify, SessionEvent, SessionEventType};
use crate::services::stats::StatReporter;
use crate::types::{OutsideSessionId, SessionId};
use crate::utils::sha256_hex;

/// Parameters of the request currently being processed.
pub type RequestParameters = BTreeMap<String, String>;

/// How an authenticated session relates to the ACR values of a new request.
#[derive(Debug, Clone)]
pub enum AcrOutcome {
    /// The session can serve the request as is.
    Corresponds(Session),
    /// The request asks for a stronger method; re-authenticate with `prompt=login`.
    StepUpRequired(Session),
    /// The request asks for a method that is not enabled.
    Unsupported { acr: String },
}

pub struct SessionService {
    store: Arc<SessionStore>,
    acr: AcrGuard,
    stats: Arc<dyn StatReporter>,
    issuer: String,
    change_session_id_on_authentication: bool,
}

impl SessionService {
    pub fn new(
        store: Arc<SessionStore>,
        acr: AcrGuard,
        stats: Arc<dyn StatReporter>,
        issuer: impl Into<String>,
        change_session_id_on_authentication: bool,
    ) -> Self {
        Self {
            store,
            acr,
            stats,
            issuer: issuer.into(),
            change_session_id_on_authentication,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Session by id, `None` when unknown or no longer valid.
    pub async fn get_session(&self, id: &SessionId) -> Option<Session> {
        let session = self.store.get(id).await?;
        if self.is_valid(&session) {
            Some(session)
        } else {
            tracing::trace!(session_id = %id, "Session is no longer valid");
            None
        }
    }

    pub fn is_valid(&self, session: &Session) -> bool {
        self.store.lifetimes().is_valid(session, Utc::now())
    }

    pub fn is_expired(&self, session: &Session) -> bool {
        self.store.lifetimes().is_expired(session, Utc::now())
    }

    pub fn get_acr(&self, session: &Session) -> Option<String> {
        AcrGuard::session_acr(session).map(str::to_string)
    }

    pub fn acr_values_list(&self, raw: &str) -> Vec<String> {
        self.acr.acr_values_list(raw)
    }

    fn client_origin(&self, redirect_uri: Option<&str>) -> Result<String, SessionError> {
        let Some(redirect_uri) = redirect_uri.filter(|uri| !uri.is_empty()) else {
            return Ok(self.issuer.clone());
        };
        let url = Url::parse(redirect_uri)
            .map_err(|err| SessionError::SessionState(format!("{}: {}", redirect_uri, err)))?;
        let host = url.host_str().ok_or_else(|| {
            SessionError::SessionState(format!("redirect uri has no host: {}", redirect_uri))
        })?;
        Ok(match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        })
    }

    /// `sha256(client_id origin opbs salt)` in hex, followed by `.salt`.
    pub fn compute_session_state(
        &self,
        client_id: Option<&str>,
        redirect_uri: Option<&str>,
        op_browser_state: &str,
        salt: &str,
    ) -> Result<String, SessionError> {
        let origin = self.client_origin(redirect_uri)?;
        let digest = sha256_hex(&format!(
            "{} {} {} {}",
            client_id.unwrap_or_default(),
            origin,
            op_browser_state,
            salt
        ));
        Ok(format!("{}.{}", digest, salt))
    }

    /// Session state for another client of the same session. The stored value
    /// is reused when the client and redirect uri are the ones it was built for.
    pub fn compute_session_state_for(
        &self,
        session: &Session,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<String, SessionError> {
        if session.attribute(attrs::CLIENT_ID) == Some(client_id)
            && session.attribute(attrs::REDIRECT_URI) == Some(redirect_uri)
        {
            return Ok(session.session_state.clone());
        }
        let salt = Uuid::new_v4().to_string();
        let opbs = session.attribute(attrs::OP_BROWSER_STATE).unwrap_or_default();
        self.compute_session_state(Some(client_id), Some(redirect_uri), opbs, &salt)
    }

    /// Builds a new session. Returns `None` for an authenticated session
    /// without a user, unless the `uma` attribute is present.
    pub async fn generate(
        &self,
        user_dn: Option<&str>,
        mut attributes: BTreeMap<String, String>,
        state: SessionIdState,
        persist: bool,
    ) -> Result<Option<Session>, SessionError> {
        let user_dn = user_dn
            .filter(|dn| !dn.trim().is_empty())
            .map(str::to_string);
        if state == SessionIdState::Authenticated
            && user_dn.is_none()
            && !attributes.contains_key(attrs::UMA)
        {
            return Ok(None);
        }

        let op_browser_state = Uuid::new_v4().to_string();
        let salt = Uuid::new_v4().to_string();
        let session_state = self.compute_session_state(
            attributes.get(attrs::CLIENT_ID).map(String::as_str),
            attributes.get(attrs::REDIRECT_URI).map(String::as_str),
            &op_browser_state,
            &salt,
        )?;
        attributes.insert(attrs::OP_BROWSER_STATE.to_string(), op_browser_state);

        let now = Utc::now();
        let (expiration_date, ttl) = self.store.lifetimes().expiration(now, state);
        let mut session = Session {
            id: SessionId::new(),
            outside_sid: OutsideSessionId::new(),
            session_state,
            state,
            user_dn,
            attributes,
            permission_granted: BTreeMap::new(),
            created_at: now,
            authentication_time: Some(now),
            last_used_at: Some(now),
            expiration_date,
            ttl,
            deleted: true,
            client: None,
            persisted: false,
            version: 0,
        };

        let persisted = persist && self.store.create(&mut session, false).await;
        tracing::trace!(
            session_id = %session.id,
            state = session.state.as_str(),
            persisted,
            "Generated new session"
        );
        Ok(Some(session))
    }

    pub async fn generate_authenticated(
        &self,
        user_dn: &str,
        attributes: BTreeMap<String, String>,
    ) -> Result<Session, SessionError> {
        let session = self
            .generate(Some(user_dn), attributes, SessionIdState::Authenticated, true)
            .await?
            .ok_or_else(|| {
                SessionError::InvalidSessionState("Failed to generate authenticated session".into())
            })?;
        self.report_active_user(&session);
        Ok(session)
    }

    pub async fn generate_unauthenticated(
        &self,
        user_dn: Option<&str>,
        attributes: BTreeMap<String, String>,
        persist: bool,
    ) -> Result<Session, SessionError> {
        self.generate(user_dn, attributes, SessionIdState::Unauthenticated, persist)
            .await?
            .ok_or_else(|| {
                SessionError::InvalidSessionState("Failed to generate unauthenticated session".into())
            })
    }

    fn report_active_user(&self, session: &Session) {
        let Some(user_dn) = session.user_dn.as_deref() else {
            return;
        };
        if let Err(err) = self.stats.report_active_user(user_dn) {
            tracing::error!(session_id = %session.id, "Failed to report active user: {:#}", err);
        }
    }

    /// Marks the session authenticated for `user_dn`. With id rotation on, the
    /// old entry is removed and the session is stored again under a new id that
    /// links back to the old one.
    pub async fn set_authenticated(
        &self,
        session: &mut Session,
        user_dn: &str,
    ) -> Result<bool, SessionError> {
        session.user_dn = Some(user_dn.to_string());
        session.authentication_time = Some(Utc::now());
        session.state = SessionIdState::Authenticated;
        self.report_active_user(session);

        let persisted = if self.change_session_id_on_authentication {
            let old_id = session.id;
            self.store.remove(session).await;

            session.id = SessionId::new();
            session
                .attributes
                .insert(attrs::OLD_SESSION_ID.to_string(), old_id.to_string());
            session.persisted = false;
            session.version = 0;
            let persisted = self.store.create(session, true).await;
            tracing::debug!(old_session_id = %old_id, session_id = %session.id, "Session id changed");
            persisted
        } else {
            self.store
                .update(session, UpdateOptions::forced())
                .await?
                .is_live()
        };

        tracing::trace!(session_id = %session.id, persisted, "Authenticated session");
        Ok(persisted)
    }

    /// Attributes the session would carry after applying `request`. The
    /// `auth_step` parameter never overrides the stored step, and PKCE
    /// parameters survive only when the request carries both of them.
    pub fn current_attributes(
        session_attributes: &BTreeMap<String, String>,
        request: &RequestParameters,
    ) -> BTreeMap<String, String> {
        let mut current = session_attributes.clone();
        for (name, value) in request {
            if !name.eq_ignore_ascii_case(attrs::AUTH_STEP) {
                current.insert(name.clone(), value.clone());
            }
        }
        if !request.contains_key(attrs::CODE_CHALLENGE)
            || !request.contains_key(attrs::CODE_CHALLENGE_METHOD)
        {
            current.remove(attrs::CODE_CHALLENGE);
            current.remove(attrs::CODE_CHALLENGE_METHOD);
        }
        current
    }

    fn should_reinit(stored: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> bool {
        let without_state = |map: &BTreeMap<String, String>| {
            map.iter()
                .filter(|(name, _)| name.as_str() != attrs::STATE)
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect::<BTreeMap<_, _>>()
        };
        without_state(stored) != without_state(current)
    }

    /// Restarts the login flow when the request changed anything besides
    /// `state`, or when forced. Forcing also downgrades the session. A new
    /// client or redirect uri gets a fresh session state.
    /// Returns whether the session was written.
    pub async fn reinit_login(
        &self,
        session: &mut Session,
        request: Option<&RequestParameters>,
        force: bool,
    ) -> Result<bool, SessionError> {
        let mut current = match request {
            Some(request) => Self::current_attributes(&session.attributes, request),
            None => session.attributes.clone(),
        };
        let changed = Self::should_reinit(&session.attributes, &current);
        tracing::trace!(session_id = %session.id, changed, force, "Reinit login check");
        if !force && !changed {
            return Ok(false);
        }

        let client_changed = [attrs::CLIENT_ID, attrs::REDIRECT_URI]
            .iter()
            .any(|name| current.get(*name) != session.attributes.get(*name));
        if client_changed {
            let salt = Uuid::new_v4().to_string();
            session.session_state = self.compute_session_state(
                current.get(attrs::CLIENT_ID).map(String::as_str),
                current.get(attrs::REDIRECT_URI).map(String::as_str),
                current
                    .get(attrs::OP_BROWSER_STATE)
                    .map(String::as_str)
                    .unwrap_or_default(),
                &salt,
            )?;
        }

        current.retain(|name, _| !name.starts_with(attrs::AUTH_STEP_PASSED_PREFIX));
        current.insert(attrs::REINIT_LOGIN.to_string(), "1".to_string());
        session.attributes = current;
        if force {
            session.state = SessionIdState::Unauthenticated;
        }

        let outcome = self.store.update(session, UpdateOptions::forced()).await?;
        if outcome != UpdateOutcome::Written {
            tracing::debug!(session_id = %session.id, ?outcome, "Failed to update session entry");
            return Ok(false);
        }
        if force {
            notify(
                self.store.events(),
                SessionEvent::new(SessionEventType::Unauthenticated, session),
            );
        }
        Ok(true)
    }

    /// Moves the flow to `target_step`. Going back clears the passed markers
    /// of `[target, current]`; skipping ahead marks `(current, target)` passed.
    /// Returns `false` when the session did not survive the write.
    pub async fn reset_to_step(
        &self,
        session: &mut Session,
        target_step: u32,
    ) -> Result<bool, SessionError> {
        let current_step = session.current_step();
        if target_step <= current_step {
            for step in target_step..=current_step {
                session.attributes.remove(&attrs::auth_step_passed(step));
            }
        } else {
            for step in current_step + 1..target_step {
                session
                    .attributes
                    .insert(attrs::auth_step_passed(step), "true".to_string());
            }
        }
        session
            .attributes
            .insert(attrs::AUTH_STEP.to_string(), target_step.to_string());

        let outcome = self.store.update(session, UpdateOptions::forced()).await?;
        if !outcome.is_live() {
            tracing::debug!(session_id = %session.id, "Failed to update session entry");
        }
        Ok(outcome.is_live())
    }

    /// Checks an authenticated session against the ACR values of a new
    /// request. A matching session also picks up the request's other
    /// parameters.
    pub async fn assert_corresponds(
        &self,
        mut session: Session,
        requested_acr_values: &str,
        request: Option<&RequestParameters>,
    ) -> Result<AcrOutcome, SessionError> {
        match self.acr.check(&session, requested_acr_values) {
            AcrCheck::NotApplicable | AcrCheck::Sufficient => Ok(AcrOutcome::Corresponds(session)),
            AcrCheck::Matches => {
                self.reinit_login(&mut session, request, false).await?;
                Ok(AcrOutcome::Corresponds(session))
            }
            AcrCheck::StepUpRequired {
                session_acr,
                requested,
            } => {
                tracing::debug!(session_id = %session.id, %session_acr, %requested, "Step-up required");
                Ok(AcrOutcome::StepUpRequired(session))
            }
            AcrCheck::Unsupported { acr } => Ok(AcrOutcome::Unsupported { acr }),
        }
    }

    /// Step-up handling: adds `login` to the prompt, downgrades the session
    /// and restarts the flow.
    pub async fn force_reauthentication(
        &self,
        session: &mut Session,
        request: Option<&RequestParameters>,
    ) -> Result<bool, SessionError> {
        let mut request = request.cloned().unwrap_or_else(|| session.attributes.clone());
        let mut prompts = request
            .get(attrs::PROMPT)
            .map(|raw| Prompt::parse_list(raw))
            .unwrap_or_default();
        if !prompts.contains(&Prompt::Login) {
            prompts.push(Prompt::Login);
        }
        request.insert(attrs::PROMPT.to_string(), Prompt::join(&prompts));
        self.reinit_login(session, Some(&request), true).await
    }

    pub async fn update_if_needed(
        &self,
        session: &mut Session,
        modified: bool,
    ) -> Result<UpdateOutcome, SessionError> {
        self.store
            .update(
                session,
                UpdateOptions {
                    update_last_used_at: true,
                    force_update: false,
                    modified,
                },
            )
            .await
    }

    pub async fn remove(&self, session: &Session) -> bool {
        self.store.remove(session).await
    }
}
