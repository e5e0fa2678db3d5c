//! Issued token entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::GrantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    AuthorizationCode,
    AccessToken,
    LongLivedAccessToken,
    RefreshToken,
    IdToken,
    DeviceCode,
    CibaRequest,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::AuthorizationCode => "authorization_code",
            TokenType::AccessToken => "access_token",
            TokenType::LongLivedAccessToken => "long_lived_access_token",
            TokenType::RefreshToken => "refresh_token",
            TokenType::IdToken => "id_token",
            TokenType::DeviceCode => "device_code",
            TokenType::CibaRequest => "ciba_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One issued code/access/refresh/... token. Only the hash of the raw token is kept.
pub struct TokenEntity {
    /// Hash of the raw token value; storage key and cache key.
    pub code: String,
    pub grant_id: GrantId,
    pub token_type: TokenType,
    pub client_id: String,
    /// Owning session, when the token was issued inside one.
    pub session_dn: Option<String>,
    pub user_dn: Option<String>,
    /// Hash of the authorization code the token was exchanged from.
    pub authorization_code: Option<String>,
    pub scope: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub expiration_date: DateTime<Utc>,
    #[serde(default = "default_deleted")]
    pub deleted: bool,
}

fn default_deleted() -> bool {
    true
}

impl TokenEntity {
    pub fn is_refresh_token(&self) -> bool {
        self.token_type == TokenType::RefreshToken
    }

    pub fn is_authorization_code(&self) -> bool {
        self.token_type == TokenType::AuthorizationCode
    }

    /// Seconds left until expiration, never negative.
    pub fn ttl_seconds(&self, now: DateTime<Utc>) -> u64 {
        (self.expiration_date - now).num_seconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ttl_is_clamped_at_zero() {
        let now = Utc::now();
        let token = TokenEntity {
            code: "h".into(),
            grant_id: GrantId::new(),
            token_type: TokenType::AccessToken,
            client_id: "rp".into(),
            session_dn: None,
            user_dn: None,
            authorization_code: None,
            scope: None,
            creation_date: now - Duration::minutes(10),
            expiration_date: now - Duration::minutes(5),
            deleted: true,
        };
        assert_eq!(token.ttl_seconds(now), 0);
        assert!(!token.is_refresh_token());
    }

    #[test]
    fn token_type_serializes_snake_case() {
        let json = serde_json::to_string(&TokenType::RefreshToken).expect("serialize");
        assert_eq!(json, "\"refresh_token\"");
        assert_eq!(TokenType::RefreshToken.as_str(), "refresh_token");
    }
}
