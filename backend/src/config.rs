use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Default lifetime (seconds) of a session when nothing else is configured.
pub const DEFAULT_SESSION_ID_LIFETIME: i64 = 86_400;

/// Largest lifetime, in seconds, accepted for any configured duration.
pub const MAX_LIFETIME_SECONDS: i64 = i32::MAX as i64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CleanTarget {
    pub partition: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_pool_size: u32,
    pub redis_connect_timeout: u64,
    pub issuer: String,

    pub session_id_unused_lifetime: i64,
    pub session_id_unauthenticated_unused_lifetime: i64,
    pub server_session_id_lifetime: Option<i64>,
    pub session_id_lifetime: Option<i64>,
    pub session_id_persist_in_cache: bool,
    pub session_id_persist_on_prompt_none: bool,
    pub change_session_id_on_authentication: bool,

    pub grant_persist_in_cache: bool,
    pub remove_refresh_tokens_for_client_on_logout: bool,
    pub access_token_lifetime: i64,
    pub id_token_lifetime: i64,

    pub maintenance_wake_interval: u64,
    pub clean_service_interval: u64,
    pub clean_service_batch_chunk_size: usize,
    pub clean_service_partitions: Vec<CleanTarget>,
    pub client_access_flush_interval: u64,
    pub key_regeneration_enabled: bool,
    pub key_regeneration_interval: u64,
    pub key_algs_allowed_for_generation: Vec<String>,

    pub acr_levels: Vec<(String, i32)>,
    /// Alias to script name, applied before level lookup.
    pub acr_mappings: Vec<(String, String)>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = optional_var("DATABASE_URL");
        let redis_url = optional_var("REDIS_URL");
        let issuer = env::var("ISSUER").unwrap_or_else(|_| "https://localhost:8443".to_string());

        let clean_service_partitions = match optional_var("CLEAN_SERVICE_PARTITIONS") {
            Some(raw) => parse_clean_targets(&raw)?,
            None => default_clean_targets(),
        };

        let acr_levels = parse_acr_levels(
            &env::var("ACR_LEVELS").unwrap_or_else(|_| "simple_password_auth:-1".to_string()),
        )?;

        let acr_mappings = parse_acr_mappings(&env::var("ACR_MAPPINGS").unwrap_or_default())?;

        let key_algs_allowed_for_generation = env::var("KEY_ALGS_ALLOWED_FOR_GENERATION")
            .unwrap_or_else(|_| "HS256,HS512".to_string())
            .split(',')
            .map(str::trim)
            .filter(|alg| !alg.is_empty())
            .map(str::to_string)
            .collect();

        let config = Config {
            database_url,
            redis_url,
            redis_pool_size: parse_var("REDIS_POOL_SIZE", 10)?,
            redis_connect_timeout: parse_var("REDIS_CONNECT_TIMEOUT", 5)?,
            issuer,
            session_id_unused_lifetime: parse_var("SESSION_ID_UNUSED_LIFETIME", 86_400)?,
            session_id_unauthenticated_unused_lifetime: parse_var(
                "SESSION_ID_UNAUTHENTICATED_UNUSED_LIFETIME",
                7_200,
            )?,
            server_session_id_lifetime: parse_optional_var("SERVER_SESSION_ID_LIFETIME")?,
            session_id_lifetime: parse_optional_var("SESSION_ID_LIFETIME")?
                .or(Some(DEFAULT_SESSION_ID_LIFETIME)),
            session_id_persist_in_cache: parse_var("SESSION_ID_PERSIST_IN_CACHE", false)?,
            session_id_persist_on_prompt_none: parse_var(
                "SESSION_ID_PERSIST_ON_PROMPT_NONE",
                false,
            )?,
            change_session_id_on_authentication: parse_var(
                "CHANGE_SESSION_ID_ON_AUTHENTICATION",
                true,
            )?,
            grant_persist_in_cache: parse_var("GRANT_PERSIST_IN_CACHE", false)?,
            remove_refresh_tokens_for_client_on_logout: parse_var(
                "REMOVE_REFRESH_TOKENS_FOR_CLIENT_ON_LOGOUT",
                true,
            )?,
            access_token_lifetime: parse_var("ACCESS_TOKEN_LIFETIME", 300)?,
            id_token_lifetime: parse_var("ID_TOKEN_LIFETIME", 3_600)?,
            maintenance_wake_interval: parse_var("MAINTENANCE_WAKE_INTERVAL", 30)?,
            clean_service_interval: parse_var("CLEAN_SERVICE_INTERVAL", 60)?,
            clean_service_batch_chunk_size: parse_var("CLEAN_SERVICE_BATCH_CHUNK_SIZE", 1_000)?,
            clean_service_partitions,
            client_access_flush_interval: parse_var("CLIENT_ACCESS_FLUSH_INTERVAL", 10)?,
            key_regeneration_enabled: parse_var("KEY_REGENERATION_ENABLED", false)?,
            key_regeneration_interval: parse_var("KEY_REGENERATION_INTERVAL", 48)?,
            key_algs_allowed_for_generation,
            acr_levels,
            acr_mappings,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects durations that cannot be represented as timestamps. Lifetimes
    /// accept `-1` for unbounded.
    pub fn validate(&self) -> anyhow::Result<()> {
        let lifetimes = [
            ("SESSION_ID_UNUSED_LIFETIME", Some(self.session_id_unused_lifetime)),
            (
                "SESSION_ID_UNAUTHENTICATED_UNUSED_LIFETIME",
                Some(self.session_id_unauthenticated_unused_lifetime),
            ),
            ("SERVER_SESSION_ID_LIFETIME", self.server_session_id_lifetime),
            ("SESSION_ID_LIFETIME", self.session_id_lifetime),
            ("ACCESS_TOKEN_LIFETIME", Some(self.access_token_lifetime)),
            ("ID_TOKEN_LIFETIME", Some(self.id_token_lifetime)),
        ];
        for (name, value) in lifetimes {
            if let Some(value) = value {
                if !(-1..=MAX_LIFETIME_SECONDS).contains(&value) {
                    return Err(anyhow!(
                        "{} out of range (-1..={}): {}",
                        name,
                        MAX_LIFETIME_SECONDS,
                        value
                    ));
                }
            }
        }

        let max_interval_secs = MAX_LIFETIME_SECONDS as u64;
        let intervals = [
            ("MAINTENANCE_WAKE_INTERVAL", self.maintenance_wake_interval),
            ("CLEAN_SERVICE_INTERVAL", self.clean_service_interval),
            ("CLIENT_ACCESS_FLUSH_INTERVAL", self.client_access_flush_interval),
        ];
        for (name, value) in intervals {
            if value > max_interval_secs {
                return Err(anyhow!("{} out of range: {}", name, value));
            }
        }
        if self.key_regeneration_interval > max_interval_secs / 3_600 {
            return Err(anyhow!(
                "KEY_REGENERATION_INTERVAL out of range: {} hours",
                self.key_regeneration_interval
            ));
        }
        Ok(())
    }

    /// Longest lifetime of a token signed with a rotated key.
    pub fn max_token_lifetime(&self) -> i64 {
        self.access_token_lifetime.max(self.id_token_lifetime)
    }
}

pub fn default_clean_targets() -> Vec<CleanTarget> {
    [
        ("sessions", "session"),
        ("tokens", "token"),
        ("scopes", "scope"),
        ("grants", "grant"),
        ("authorizations", "client_authorization"),
    ]
    .into_iter()
    .map(|(partition, kind)| CleanTarget {
        partition: partition.to_string(),
        kind: kind.to_string(),
    })
    .collect()
}

/// Parses `partition:kind` pairs separated by commas.
pub fn parse_clean_targets(raw: &str) -> anyhow::Result<Vec<CleanTarget>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (partition, kind) = item
                .split_once(':')
                .ok_or_else(|| anyhow!("Invalid CLEAN_SERVICE_PARTITIONS entry: {}", item))?;
            Ok(CleanTarget {
                partition: partition.trim().to_string(),
                kind: kind.trim().to_string(),
            })
        })
        .collect()
}

/// Parses `acr:level` pairs separated by commas.
pub fn parse_acr_levels(raw: &str) -> anyhow::Result<Vec<(String, i32)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (acr, level) = item
                .rsplit_once(':')
                .ok_or_else(|| anyhow!("Invalid ACR_LEVELS entry: {}", item))?;
            let level = level
                .trim()
                .parse::<i32>()
                .map_err(|_| anyhow!("Invalid ACR level for {}: {}", acr, level))?;
            Ok((acr.trim().to_string(), level))
        })
        .collect()
}

/// Parses `alias=script` pairs separated by commas.
pub fn parse_acr_mappings(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (alias, script) = item
                .split_once('=')
                .ok_or_else(|| anyhow!("Invalid ACR_MAPPINGS entry: {}", item))?;
            Ok((alias.trim().to_string(), script.trim().to_string()))
        })
        .collect()
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("Invalid {} value: {}", name, raw)),
        None => Ok(default),
    }
}

fn parse_optional_var<T: FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    optional_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| anyhow!("Invalid {} value: {}", name, raw))
        })
        .transpose()
}
