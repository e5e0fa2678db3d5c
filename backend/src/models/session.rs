//! Authentication session model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OutsideSessionId, SessionId};

/// Well-known keys of the session attribute map.
pub mod attrs {
    pub const CLIENT_ID: &str = "client_id";
    pub const REDIRECT_URI: &str = "redirect_uri";
    pub const SCOPE: &str = "scope";
    pub const STATE: &str = "state";
    pub const PROMPT: &str = "prompt";
    pub const ACR: &str = "acr";
    pub const ACR_VALUES: &str = "acr_values";
    pub const CODE_CHALLENGE: &str = "code_challenge";
    pub const CODE_CHALLENGE_METHOD: &str = "code_challenge_method";
    pub const AUTH_STEP: &str = "auth_step";
    pub const AUTH_STEP_PASSED_PREFIX: &str = "auth_step_passed_";
    pub const REINIT_LOGIN: &str = "c";
    pub const OLD_SESSION_ID: &str = "old_session_id";
    pub const OP_BROWSER_STATE: &str = "opbs";
    pub const AUTHENTICATED_USER: &str = "auth_user";
    pub const UMA: &str = "uma";

    pub fn auth_step_passed(step: u32) -> String {
        format!("{}{}", AUTH_STEP_PASSED_PREFIX, step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionIdState {
    Unauthenticated,
    Authenticated,
}

impl SessionIdState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionIdState::Unauthenticated => "unauthenticated",
            SessionIdState::Authenticated => "authenticated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prompt {
    None,
    Login,
    Consent,
    SelectAccount,
}

impl Prompt {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prompt::None => "none",
            Prompt::Login => "login",
            Prompt::Consent => "consent",
            Prompt::SelectAccount => "select_account",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Prompt::None),
            "login" => Some(Prompt::Login),
            "consent" => Some(Prompt::Consent),
            "select_account" => Some(Prompt::SelectAccount),
            _ => None,
        }
    }

    /// Parses a space separated prompt list, skipping unknown values.
    pub fn parse_list(raw: &str) -> Vec<Prompt> {
        raw.split_whitespace().filter_map(Prompt::parse).collect()
    }

    pub fn join(prompts: &[Prompt]) -> String {
        prompts
            .iter()
            .map(Prompt::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Client bound to the session for the duration of one request. Never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundClient {
    pub client_id: String,
    pub client_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One browser/agent authentication context.
pub struct Session {
    /// Internal identifier, also the storage key.
    pub id: SessionId,
    /// Identifier exposed to the browser (`sid`).
    pub outside_sid: OutsideSessionId,
    /// Salted hash used by front-channel logout iframes.
    pub session_state: String,
    pub state: SessionIdState,
    /// Directory reference of the authenticated user.
    pub user_dn: Option<String>,
    /// Current request parameters plus internal bookkeeping keys.
    pub attributes: BTreeMap<String, String>,
    /// Consent tracking: client id to granted flag.
    #[serde(default)]
    pub permission_granted: BTreeMap<String, bool>,
    pub created_at: DateTime<Utc>,
    pub authentication_time: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expiration_date: DateTime<Utc>,
    /// Time to live in seconds, used by the cache tier.
    pub ttl: i64,
    /// Entries eligible for the expiry sweep carry `deleted = true`.
    #[serde(default = "default_deleted")]
    pub deleted: bool,
    #[serde(skip)]
    pub client: Option<BoundClient>,
    #[serde(skip)]
    pub persisted: bool,
    #[serde(skip)]
    pub version: i64,
}

fn default_deleted() -> bool {
    true
}

impl Session {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionIdState::Authenticated
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.attribute(attrs::PROMPT)
            .map(Prompt::parse_list)
            .unwrap_or_default()
    }

    /// Adds `prompt` to the prompt attribute unless it is already present.
    pub fn add_prompt(&mut self, prompt: Prompt) {
        let mut prompts = self.prompts();
        if !prompts.contains(&prompt) {
            prompts.push(prompt);
        }
        self.attributes
            .insert(attrs::PROMPT.to_string(), Prompt::join(&prompts));
    }

    /// Current authentication step, `1` when absent or unparsable.
    pub fn current_step(&self) -> u32 {
        self.attribute(attrs::AUTH_STEP)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1)
    }

    /// Moves `last_used_at` to `at` unless that would move it backwards.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        match self.last_used_at {
            Some(previous) if previous >= at => {}
            _ => self.last_used_at = Some(at),
        }
    }

    pub fn is_permission_granted(&self, client_id: &str) -> bool {
        self.permission_granted
            .get(client_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn grant_permission(&mut self, client_id: &str, granted: bool) {
        self.permission_granted
            .insert(client_id.to_string(), granted);
    }
}
