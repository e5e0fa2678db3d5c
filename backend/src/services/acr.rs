//! Authentication-strength (ACR) comparison.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::models::session::{attrs, Session};

#[cfg_attr(test, mockall::automock)]
pub trait AcrLevelMapping: Send + Sync {
    /// Canonical script name for an ACR value or alias.
    fn script_name(&self, acr: &str) -> String;

    /// Strength of a script; `None` when the method is not enabled.
    fn level(&self, script_name: &str) -> Option<i32>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticAcrLevels {
    levels: HashMap<String, i32>,
    aliases: HashMap<String, String>,
}

impl StaticAcrLevels {
    pub fn new<I>(levels: I) -> Self
    where
        I: IntoIterator<Item = (String, i32)>,
    {
        Self {
            levels: levels.into_iter().collect(),
            aliases: HashMap::new(),
        }
    }

    pub fn with_aliases<I>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.aliases.extend(aliases);
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.acr_levels.iter().cloned()).with_aliases(config.acr_mappings.iter().cloned())
    }
}

impl AcrLevelMapping for StaticAcrLevels {
    fn script_name(&self, acr: &str) -> String {
        self.aliases
            .get(acr)
            .cloned()
            .unwrap_or_else(|| acr.to_string())
    }

    fn level(&self, script_name: &str) -> Option<i32> {
        self.levels.get(script_name).copied()
    }
}

/// Result of comparing a session's ACR against the requested ACR values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcrCheck {
    /// Session is not authenticated, has no attributes or no recorded ACR.
    NotApplicable,
    /// Session ACR is among the requested values (or nothing was requested).
    Matches,
    /// Session ACR differs but is at least as strong as every requested value.
    Sufficient,
    /// A requested value is stronger than the session's ACR.
    StepUpRequired { session_acr: String, requested: String },
    /// A requested value has no known level.
    Unsupported { acr: String },
}

#[derive(Clone)]
pub struct AcrGuard {
    mapping: Arc<dyn AcrLevelMapping>,
}

impl AcrGuard {
    pub fn new(mapping: Arc<dyn AcrLevelMapping>) -> Self {
        Self { mapping }
    }

    /// ACR recorded on the session: the `acr` claim, else `acr_values`.
    pub fn session_acr(session: &Session) -> Option<&str> {
        [attrs::ACR, attrs::ACR_VALUES]
            .into_iter()
            .filter_map(|key| session.attribute(key))
            .find(|value| !value.trim().is_empty())
    }

    /// Parses requested ACR values, given either as a JSON array or a space
    /// separated string, into distinct script names in request order.
    pub fn acr_values_list(&self, raw: &str) -> Vec<String> {
        let values: Vec<String> = match serde_json::from_str::<Vec<String>>(raw) {
            Ok(values) => values,
            Err(_) => raw.split_whitespace().map(str::to_string).collect(),
        };

        let mut scripts: Vec<String> = Vec::with_capacity(values.len());
        for value in values.iter().filter(|value| !value.trim().is_empty()) {
            let script = self.mapping.script_name(value.trim());
            if !scripts.contains(&script) {
                scripts.push(script);
            }
        }
        scripts
    }

    pub fn check(&self, session: &Session, requested_acr_values: &str) -> AcrCheck {
        if !session.is_authenticated() || session.attributes.is_empty() {
            return AcrCheck::NotApplicable;
        }
        let Some(session_acr) = Self::session_acr(session) else {
            tracing::trace!(session_id = %session.id, "No acr recorded on session");
            return AcrCheck::NotApplicable;
        };

        let requested = self.acr_values_list(requested_acr_values);
        let session_script = self.mapping.script_name(session_acr);
        if requested.is_empty()
            || requested.iter().any(|acr| acr == session_acr || *acr == session_script)
        {
            return AcrCheck::Matches;
        }

        // Unknown session level ranks below every known level.
        let session_level = self.mapping.level(&session_script).unwrap_or(i32::MIN);
        for acr in &requested {
            let requested_level = self.mapping.level(acr);
            tracing::info!(
                session_id = %session.id,
                session_acr,
                session_level,
                requested_acr = %acr,
                requested_level,
                "Acr is changed"
            );
            match requested_level {
                None => return AcrCheck::Unsupported { acr: acr.clone() },
                Some(level) if session_level < level => {
                    return AcrCheck::StepUpRequired {
                        session_acr: session_acr.to_string(),
                        requested: acr.clone(),
                    }
                }
                Some(_) => {}
            }
        }
        AcrCheck::Sufficient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::SessionIdState;
    use crate::types::{OutsideSessionId, SessionId};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn guard() -> AcrGuard {
        let levels = StaticAcrLevels::new([
            ("basic".to_string(), 10),
            ("otp".to_string(), 20),
            ("u2f".to_string(), 30),
        ])
        .with_aliases([("urn:otp".to_string(), "otp".to_string())]);
        AcrGuard::new(Arc::new(levels))
    }

    fn session(acr: &str) -> Session {
        let now = Utc::now();
        let mut attributes = BTreeMap::new();
        attributes.insert(attrs::ACR.to_string(), acr.to_string());
        attributes.insert(attrs::CLIENT_ID.to_string(), "rp".to_string());
        Session {
            id: SessionId::new(),
            outside_sid: OutsideSessionId::new(),
            session_state: String::new(),
            state: SessionIdState::Authenticated,
            user_dn: Some("uid=alice".into()),
            attributes,
            permission_granted: BTreeMap::new(),
            created_at: now,
            authentication_time: Some(now),
            last_used_at: Some(now),
            expiration_date: now + Duration::hours(1),
            ttl: 3_600,
            deleted: true,
            client: None,
            persisted: true,
            version: 1,
        }
    }

    #[test]
    fn acr_values_accept_json_and_space_separated() {
        let guard = guard();
        assert_eq!(guard.acr_values_list(r#"["otp","basic"]"#), vec!["otp", "basic"]);
        assert_eq!(guard.acr_values_list("otp  basic otp"), vec!["otp", "basic"]);
        assert_eq!(guard.acr_values_list("urn:otp otp"), vec!["otp"]);
        assert!(guard.acr_values_list("").is_empty());
    }

    #[test]
    fn stronger_request_requires_step_up() {
        assert_eq!(
            guard().check(&session("basic"), "otp"),
            AcrCheck::StepUpRequired {
                session_acr: "basic".into(),
                requested: "otp".into()
            }
        );
    }

    #[test]
    fn unknown_request_is_unsupported() {
        assert_eq!(
            guard().check(&session("basic"), "smartcard"),
            AcrCheck::Unsupported {
                acr: "smartcard".into()
            }
        );
    }

    #[test]
    fn weaker_request_keeps_stronger_session() {
        assert_eq!(guard().check(&session("u2f"), "basic otp"), AcrCheck::Sufficient);
    }

    #[test]
    fn matching_or_empty_request_matches() {
        assert_eq!(guard().check(&session("otp"), "basic otp"), AcrCheck::Matches);
        assert_eq!(guard().check(&session("otp"), "urn:otp"), AcrCheck::Matches);
        assert_eq!(guard().check(&session("otp"), ""), AcrCheck::Matches);
    }

    #[test]
    fn unauthenticated_or_acr_less_session_is_not_checked() {
        let mut unauthenticated = session("basic");
        unauthenticated.state = SessionIdState::Unauthenticated;
        assert_eq!(guard().check(&unauthenticated, "u2f"), AcrCheck::NotApplicable);

        let mut no_acr = session("basic");
        no_acr.attributes.remove(attrs::ACR);
        assert_eq!(guard().check(&no_acr, "u2f"), AcrCheck::NotApplicable);
    }

    #[test]
    fn acr_values_attribute_is_the_fallback() {
        let mut session = session("basic");
        session.attributes.remove(attrs::ACR);
        session
            .attributes
            .insert(attrs::ACR_VALUES.into(), "u2f".into());
        assert_eq!(AcrGuard::session_acr(&session), Some("u2f"));
        assert_eq!(guard().check(&session, "otp"), AcrCheck::Sufficient);
    }

    #[test]
    fn unknown_session_level_is_weakest() {
        assert!(matches!(
            guard().check(&session("legacy"), "basic"),
            AcrCheck::StepUpRequired { .. }
        ));
    }

    #[test]
    fn mapping_is_consulted_through_the_trait() {
        let mut mapping = MockAcrLevelMapping::new();
        mapping
            .expect_script_name()
            .returning(|acr| acr.to_lowercase());
        mapping.expect_level().returning(|script| match script {
            "basic" => Some(1),
            "otp" => Some(2),
            _ => None,
        });
        let guard = AcrGuard::new(Arc::new(mapping));
        assert!(matches!(
            guard.check(&session("basic"), "OTP"),
            AcrCheck::StepUpRequired { .. }
        ));
    }
}
