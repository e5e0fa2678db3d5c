//! Token and grant persistence keyed by hashed token value.

use std::sync::Arc;

use chrono::Utc;

use crate::error::StoreError;
use crate::models::grant::TokenEntity;
use crate::persistence::{
    cache_key, kinds, partitions, CacheBackend, Filter, PersistenceBackend, StorageTier,
    StoredEntry,
};
use crate::types::GrantId;
use crate::utils::hash_token;

pub struct GrantStore {
    tier: Arc<dyn StorageTier>,
    durable: Arc<dyn PersistenceBackend>,
    cache: Arc<dyn CacheBackend>,
    persist_in_cache: bool,
    remove_refresh_tokens_on_logout: bool,
}

impl GrantStore {
    pub fn new(
        tier: Arc<dyn StorageTier>,
        durable: Arc<dyn PersistenceBackend>,
        cache: Arc<dyn CacheBackend>,
        persist_in_cache: bool,
        remove_refresh_tokens_on_logout: bool,
    ) -> Self {
        Self {
            tier,
            durable,
            cache,
            persist_in_cache,
            remove_refresh_tokens_on_logout,
        }
    }

    fn encode(token: &TokenEntity) -> Result<StoredEntry, StoreError> {
        Ok(
            StoredEntry::encode(partitions::TOKENS, kinds::TOKEN, &token.code, token)?
                .with_expiration(token.deleted, Some(token.expiration_date)),
        )
    }

    /// Stores a token. Authorization codes issued into the durable tier also
    /// get a cache shadow so the code exchange is a single cache hit.
    pub async fn persist(&self, token: &TokenEntity) -> Result<(), StoreError> {
        let entry = Self::encode(token)?;
        let ttl = token.ttl_seconds(Utc::now());
        self.tier.insert(&entry, ttl).await?;

        if token.is_authorization_code() && !self.persist_in_cache {
            if let Err(err) = self.cache.put(&entry.cache_key(), &entry, ttl).await {
                tracing::warn!(grant_id = %token.grant_id, "Failed to cache authorization code: {}", err);
            }
        }
        tracing::trace!(
            grant_id = %token.grant_id,
            token_type = token.token_type.as_str(),
            "Persisted token"
        );
        Ok(())
    }

    /// Looks a raw token value up, cache first. Failures read as not found.
    pub async fn find_by_code(&self, code: &str) -> Option<TokenEntity> {
        let hashed = hash_token(code);
        match self.cache.get(&cache_key(partitions::TOKENS, &hashed)).await {
            Ok(Some(entry)) => match entry.decode() {
                Ok(token) => return Some(token),
                Err(err) => tracing::warn!("Failed to decode cached token: {}", err),
            },
            Ok(None) => {}
            Err(err) => tracing::warn!("Failed to read token cache: {}", err),
        }

        match self.tier.load(partitions::TOKENS, &hashed).await {
            Ok(Some(entry)) => entry
                .decode()
                .map_err(|err| tracing::error!("Failed to decode token: {}", err))
                .ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::error!("Failed to find token: {}", err);
                None
            }
        }
    }

    async fn find_by(&self, attribute: &str, value: &str) -> Result<Vec<TokenEntity>, StoreError> {
        self.durable
            .find_entries(
                partitions::TOKENS,
                kinds::TOKEN,
                &Filter::equals(attribute, value),
            )
            .await?
            .iter()
            .map(StoredEntry::decode)
            .collect()
    }

    pub async fn find_by_grant_id(&self, grant_id: &GrantId) -> Result<Vec<TokenEntity>, StoreError> {
        self.find_by("grant_id", &grant_id.to_string()).await
    }

    /// Tokens exchanged from the given raw authorization code.
    pub async fn find_by_authorization_code(
        &self,
        code: &str,
    ) -> Result<Vec<TokenEntity>, StoreError> {
        self.find_by("authorization_code", &hash_token(code)).await
    }

    pub async fn find_by_session_dn(&self, session_dn: &str) -> Result<Vec<TokenEntity>, StoreError> {
        self.find_by("session_dn", session_dn).await
    }

    /// Removes a token and its cache shadow. Always logs, never fails.
    pub async fn remove_silently(&self, token: &TokenEntity) -> bool {
        if let Err(err) = self.tier.delete(partitions::TOKENS, &token.code).await {
            tracing::error!(grant_id = %token.grant_id, "Failed to remove token: {}", err);
            return false;
        }
        if token.is_authorization_code() && !self.persist_in_cache {
            if let Err(err) = self
                .cache
                .remove(&cache_key(partitions::TOKENS, &token.code))
                .await
            {
                tracing::warn!(grant_id = %token.grant_id, "Failed to evict cached code: {}", err);
            }
        }
        tracing::trace!(grant_id = %token.grant_id, "Removed token");
        true
    }

    /// Best-effort removal of every token in `tokens`; returns how many went.
    pub async fn remove_all_silently(&self, tokens: &[TokenEntity]) -> usize {
        let mut removed = 0;
        for token in tokens {
            if self.remove_silently(token).await {
                removed += 1;
            }
        }
        removed
    }

    /// Drops the tokens issued inside a session. Refresh tokens survive when
    /// configured to.
    pub async fn logout(&self, session_dn: &str) -> usize {
        let tokens = match self.find_by_session_dn(session_dn).await {
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::error!(session_dn, "Failed to find tokens for logout: {}", err);
                return 0;
            }
        };

        let doomed: Vec<TokenEntity> = tokens
            .into_iter()
            .filter(|token| self.remove_refresh_tokens_on_logout || !token.is_refresh_token())
            .collect();
        let removed = self.remove_all_silently(&doomed).await;
        tracing::debug!(session_dn, removed, "Removed session tokens on logout");
        removed
    }

    pub async fn revoke_grant(&self, grant_id: &GrantId) -> usize {
        match self.find_by_grant_id(grant_id).await {
            Ok(tokens) => self.remove_all_silently(&tokens).await,
            Err(err) => {
                tracing::error!(grant_id = %grant_id, "Failed to find tokens for grant: {}", err);
                0
            }
        }
    }

    pub async fn remove_by_code(&self, code: &str) -> bool {
        match self.find_by_code(code).await {
            Some(token) => self.remove_silently(&token).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::grant::TokenType;
    use crate::persistence::memory::{InMemoryCache, InMemoryPersistence};
    use crate::persistence::select_tier;
    use chrono::Duration;

    struct Fixture {
        store: GrantStore,
        backend: Arc<InMemoryPersistence>,
        cache: Arc<InMemoryCache>,
    }

    fn fixture(persist_in_cache: bool, remove_refresh: bool) -> Fixture {
        let backend = Arc::new(InMemoryPersistence::new());
        let cache = Arc::new(InMemoryCache::new());
        let tier = select_tier(persist_in_cache, backend.clone(), cache.clone());
        Fixture {
            store: GrantStore::new(tier, backend.clone(), cache.clone(), persist_in_cache, remove_refresh),
            backend,
            cache,
        }
    }

    fn token(raw: &str, token_type: TokenType, grant_id: GrantId) -> TokenEntity {
        let now = Utc::now();
        TokenEntity {
            code: hash_token(raw),
            grant_id,
            token_type,
            client_id: "rp".into(),
            session_dn: Some("session-1".into()),
            user_dn: Some("uid=alice".into()),
            authorization_code: None,
            scope: Some("openid".into()),
            creation_date: now,
            expiration_date: now + Duration::minutes(5),
            deleted: true,
        }
    }

    #[tokio::test]
    async fn authorization_code_is_shadowed_in_cache() {
        let fx = fixture(false, true);
        let code = token("code-1", TokenType::AuthorizationCode, GrantId::new());
        fx.store.persist(&code).await.expect("persist");
        assert_eq!(fx.backend.len(), 1);
        assert_eq!(fx.cache.len(), 1);

        let found = fx.store.find_by_code("code-1").await.expect("found");
        assert_eq!(found.code, code.code);

        assert!(fx.store.remove_by_code("code-1").await);
        assert!(fx.backend.is_empty());
        assert!(fx.store.find_by_code("code-1").await.is_none());
    }

    #[tokio::test]
    async fn find_by_code_falls_back_to_durable_tier() {
        let fx = fixture(false, true);
        let access = token("at-1", TokenType::AccessToken, GrantId::new());
        fx.store.persist(&access).await.expect("persist");
        assert!(fx.cache.is_empty());
        assert!(fx.store.find_by_code("at-1").await.is_some());
        assert!(fx.store.find_by_code("unknown").await.is_none());
    }

    #[tokio::test]
    async fn cache_mode_writes_only_to_cache() {
        let fx = fixture(true, true);
        let code = token("code-1", TokenType::AuthorizationCode, GrantId::new());
        fx.store.persist(&code).await.expect("persist");
        assert!(fx.backend.is_empty());
        assert_eq!(fx.cache.len(), 1);
        assert!(fx.store.find_by_code("code-1").await.is_some());
    }

    #[tokio::test]
    async fn logout_keeps_refresh_tokens_when_configured() {
        let fx = fixture(false, false);
        let grant = GrantId::new();
        for (raw, kind) in [
            ("at", TokenType::AccessToken),
            ("rt", TokenType::RefreshToken),
            ("id", TokenType::IdToken),
        ] {
            fx.store.persist(&token(raw, kind, grant)).await.expect("persist");
        }

        assert_eq!(fx.store.logout("session-1").await, 2);
        let left = fx.store.find_by_session_dn("session-1").await.expect("query");
        assert_eq!(left.len(), 1);
        assert!(left[0].is_refresh_token());
    }

    #[tokio::test]
    async fn logout_removes_refresh_tokens_by_default() {
        let fx = fixture(false, true);
        let grant = GrantId::new();
        fx.store
            .persist(&token("at", TokenType::AccessToken, grant))
            .await
            .expect("persist");
        fx.store
            .persist(&token("rt", TokenType::RefreshToken, grant))
            .await
            .expect("persist");

        assert_eq!(fx.store.logout("session-1").await, 2);
        assert!(fx.backend.is_empty());
    }

    #[tokio::test]
    async fn revoke_grant_removes_every_token_of_the_grant() {
        let fx = fixture(false, true);
        let grant = GrantId::new();
        let other = GrantId::new();
        fx.store.persist(&token("a", TokenType::AccessToken, grant)).await.expect("persist");
        fx.store.persist(&token("b", TokenType::RefreshToken, grant)).await.expect("persist");
        fx.store.persist(&token("c", TokenType::AccessToken, other)).await.expect("persist");

        assert_eq!(fx.store.revoke_grant(&grant).await, 2);
        assert_eq!(fx.store.find_by_grant_id(&other).await.expect("query").len(), 1);
    }

    #[tokio::test]
    async fn tokens_are_found_by_authorization_code() {
        let fx = fixture(false, true);
        let mut access = token("at", TokenType::AccessToken, GrantId::new());
        access.authorization_code = Some(hash_token("code-1"));
        fx.store.persist(&access).await.expect("persist");

        let found = fx
            .store
            .find_by_authorization_code("code-1")
            .await
            .expect("query");
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn remove_silently_swallows_backend_errors() {
        use crate::persistence::tier::MockStorageTier;

        let mut tier = MockStorageTier::new();
        tier.expect_delete()
            .returning(|_, _| Err(StoreError::Cache("down".into())));
        let store = GrantStore::new(
            Arc::new(tier),
            Arc::new(InMemoryPersistence::new()),
            Arc::new(InMemoryCache::new()),
            false,
            true,
        );
        let grant = GrantId::new();
        let tokens = vec![
            token("a", TokenType::AccessToken, grant),
            token("b", TokenType::AccessToken, grant),
        ];
        assert_eq!(store.remove_all_silently(&tokens).await, 0);
    }
}
