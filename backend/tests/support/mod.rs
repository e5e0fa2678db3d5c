#![allow(dead_code)]
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use sessionkeeper_backend::{
    config::{default_clean_targets, Config},
    models::session::Session,
    persistence::memory::{InMemoryCache, InMemoryPersistence},
    services::session_events::{SessionEvent, SessionEventListener, SessionEventType},
    state::AppState,
    types::SessionId,
};

pub fn test_config() -> Config {
    Config {
        database_url: None,
        redis_url: None,
        redis_pool_size: 2,
        redis_connect_timeout: 5,
        issuer: "https://op.example.com".into(),
        session_id_unused_lifetime: 86_400,
        session_id_unauthenticated_unused_lifetime: 600,
        server_session_id_lifetime: None,
        session_id_lifetime: Some(86_400),
        session_id_persist_in_cache: false,
        session_id_persist_on_prompt_none: false,
        change_session_id_on_authentication: true,
        grant_persist_in_cache: false,
        remove_refresh_tokens_for_client_on_logout: true,
        access_token_lifetime: 300,
        id_token_lifetime: 3_600,
        maintenance_wake_interval: 1,
        clean_service_interval: 60,
        clean_service_batch_chunk_size: 100,
        clean_service_partitions: default_clean_targets(),
        client_access_flush_interval: 10,
        key_regeneration_enabled: false,
        key_regeneration_interval: 48,
        key_algs_allowed_for_generation: vec!["HS256".into(), "HS512".into()],
        acr_levels: vec![
            ("basic".into(), 10),
            ("otp".into(), 20),
            ("fido".into(), 30),
        ],
        acr_mappings: vec![("urn:pwd".into(), "basic".into())],
    }
}

/// Session events seen by the engine, in firing order.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(SessionEventType, SessionId)>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<(SessionEventType, SessionId)> {
        self.events.lock().expect("lock events").clone()
    }

    pub fn count(&self, event_type: SessionEventType) -> usize {
        self.events()
            .iter()
            .filter(|(seen, _)| *seen == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("lock events").clear();
    }
}

impl SessionEventListener for RecordingListener {
    fn on_event(&self, event: &SessionEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .expect("lock events")
            .push((event.event_type, event.session.id));
        Ok(())
    }
}

pub struct TestEngine {
    pub state: AppState,
    pub durable: Arc<InMemoryPersistence>,
    pub cache: Arc<InMemoryCache>,
    pub events: Arc<RecordingListener>,
}

pub fn engine(config: Config) -> TestEngine {
    let durable = Arc::new(InMemoryPersistence::new());
    let cache = Arc::new(InMemoryCache::new());
    let events = Arc::new(RecordingListener::default());
    let state = AppState::with_backends(config, durable.clone(), cache.clone(), events.clone());
    TestEngine {
        state,
        durable,
        cache,
        events,
    }
}

pub fn client_attributes(client_id: &str) -> std::collections::BTreeMap<String, String> {
    std::collections::BTreeMap::from([
        ("client_id".to_string(), client_id.to_string()),
        (
            "redirect_uri".to_string(),
            format!("https://{}.example.com/cb", client_id),
        ),
        ("scope".to_string(), "openid".to_string()),
    ])
}

pub fn same_session(left: &Session, right: &Session) -> bool {
    left.id == right.id && left.state == right.state && left.attributes == right.attributes
}

pub fn allocate_ephemeral_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("read socket addr")
        .port()
}
