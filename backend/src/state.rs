use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::db::{connection, redis::create_redis_pool};
use crate::persistence::memory::{InMemoryCache, InMemoryPersistence};
use crate::persistence::postgres::PgPersistence;
use crate::persistence::redis::RedisCache;
use crate::persistence::{select_tier, CacheBackend, PersistenceBackend};
use crate::repositories::{GrantStore, KeySetStore, SessionStore};
use crate::services::acr::{AcrGuard, StaticAcrLevels};
use crate::services::key_rotator::{CryptoKeyRotator, LocalKeyRotator};
use crate::services::maintenance::{
    ClientAccessFlush, ClientAccessTracker, ExpiredEntryCleaner, KeyRotation, ScheduledJob,
};
use crate::services::session::SessionService;
use crate::services::session_events::{SessionEventListener, TracingSessionEventListener};
use crate::services::session_policy::SessionLifetimes;
use crate::services::stats::ActiveUserStats;

/// Everything the engine needs, wired once from configuration.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub durable: Arc<dyn PersistenceBackend>,
    pub cache: Arc<dyn CacheBackend>,
    pub sessions: Arc<SessionService>,
    pub grants: Arc<GrantStore>,
    pub client_access: Arc<ClientAccessTracker>,
    pub key_rotator: Arc<dyn CryptoKeyRotator>,
    pub stats: Arc<ActiveUserStats>,
}

impl AppState {
    /// Connects PostgreSQL and Redis when configured; either falls back to
    /// its in-process implementation otherwise.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let durable: Arc<dyn PersistenceBackend> = match &config.database_url {
            Some(url) => {
                let pool = connection::create_pool(url).await?;
                connection::run_migrations(&pool).await?;
                Arc::new(PgPersistence::new(pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, durable tier is in-process only");
                Arc::new(InMemoryPersistence::new())
            }
        };
        let cache: Arc<dyn CacheBackend> = match create_redis_pool(&config).await? {
            Some(pool) => Arc::new(RedisCache::new(pool)),
            None => Arc::new(InMemoryCache::new()),
        };
        Ok(Self::with_backends(
            config,
            durable,
            cache,
            Arc::new(TracingSessionEventListener),
        ))
    }

    pub fn with_backends(
        config: Config,
        durable: Arc<dyn PersistenceBackend>,
        cache: Arc<dyn CacheBackend>,
        events: Arc<dyn SessionEventListener>,
    ) -> Self {
        let session_tier = select_tier(
            config.session_id_persist_in_cache,
            durable.clone(),
            cache.clone(),
        );
        let store = SessionStore::new(
            session_tier,
            durable.clone(),
            SessionLifetimes::from_config(&config),
            events,
        );
        let stats = Arc::new(ActiveUserStats::new());
        let sessions = SessionService::new(
            Arc::new(store),
            AcrGuard::new(Arc::new(StaticAcrLevels::from_config(&config))),
            stats.clone(),
            config.issuer.clone(),
            config.change_session_id_on_authentication,
        );

        let grant_tier = select_tier(config.grant_persist_in_cache, durable.clone(), cache.clone());
        let grants = GrantStore::new(
            grant_tier,
            durable.clone(),
            cache.clone(),
            config.grant_persist_in_cache,
            config.remove_refresh_tokens_for_client_on_logout,
        );

        Self {
            config,
            durable,
            cache,
            sessions: Arc::new(sessions),
            grants: Arc::new(grants),
            client_access: Arc::new(ClientAccessTracker::new()),
            key_rotator: Arc::new(LocalKeyRotator::new()),
            stats,
        }
    }

    pub fn cleaner(&self) -> ExpiredEntryCleaner {
        ExpiredEntryCleaner::from_config(&self.config, self.durable.clone(), self.cache.clone())
    }

    pub fn client_access_flush(&self) -> ClientAccessFlush {
        ClientAccessFlush::new(
            self.client_access.clone(),
            self.durable.clone(),
            Duration::from_secs(self.config.client_access_flush_interval),
        )
    }

    pub fn key_rotation(&self) -> KeyRotation {
        KeyRotation::from_config(
            &self.config,
            KeySetStore::new(self.durable.clone()),
            self.key_rotator.clone(),
        )
    }

    /// Arms the sweep, the client access flush and, when enabled, key rotation.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let wake = Duration::from_secs(self.config.maintenance_wake_interval.max(1));
        let mut handles = vec![
            Arc::new(ScheduledJob::new(self.cleaner(), wake)).spawn(),
            Arc::new(ScheduledJob::new(self.client_access_flush(), wake)).spawn(),
        ];
        if self.config.key_regeneration_enabled {
            handles.push(Arc::new(ScheduledJob::new(self.key_rotation(), wake)).spawn());
        } else {
            tracing::debug!("Key regeneration disabled");
        }
        handles
    }
}
