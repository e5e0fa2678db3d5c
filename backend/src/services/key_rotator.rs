//! Signing key generation collaborator.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use uuid::Uuid;

use crate::models::key_set::{JsonWebKey, KeySetDocument};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CryptoKeyRotator: Send + Sync {
    /// Generates one fresh key per algorithm, each expiring at `expiration`.
    async fn generate_key_set(
        &self,
        algs: &[String],
        expiration: DateTime<Utc>,
    ) -> anyhow::Result<KeySetDocument>;

    async fn contains_key(&self, kid: &str) -> anyhow::Result<bool>;

    async fn delete_key(&self, kid: &str) -> anyhow::Result<bool>;
}

struct KeyMaterial {
    alg: String,
    secret: String,
}

/// Keeps random HMAC secrets in process memory, keyed by `kid`.
#[derive(Default)]
pub struct LocalKeyRotator {
    keys: DashMap<String, KeyMaterial>,
}

impl LocalKeyRotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base64url encoded secret of a key.
    pub fn secret(&self, kid: &str) -> Option<String> {
        self.keys.get(kid).map(|key| key.secret.clone())
    }

    pub fn algorithm(&self, kid: &str) -> Option<String> {
        self.keys.get(kid).map(|key| key.alg.clone())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn secret_len(alg: &str) -> Option<usize> {
    match alg {
        "HS256" => Some(32),
        "HS384" => Some(48),
        "HS512" => Some(64),
        _ => None,
    }
}

#[async_trait]
impl CryptoKeyRotator for LocalKeyRotator {
    async fn generate_key_set(
        &self,
        algs: &[String],
        expiration: DateTime<Utc>,
    ) -> anyhow::Result<KeySetDocument> {
        let mut keys = Vec::with_capacity(algs.len());
        for alg in algs {
            let len = secret_len(alg)
                .ok_or_else(|| anyhow::anyhow!("Unsupported key algorithm: {}", alg))?;
            let mut bytes = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut bytes);

            let kid = format!("{}_{}", Uuid::new_v4(), alg.to_lowercase());
            self.keys.insert(
                kid.clone(),
                KeyMaterial {
                    alg: alg.clone(),
                    secret: URL_SAFE_NO_PAD.encode(&bytes),
                },
            );
            tracing::debug!(kid = %kid, alg = %alg, "Generated signing key");
            keys.push(JsonWebKey {
                kid,
                alg: alg.clone(),
                key_use: "sig".to_string(),
                exp: Some(expiration),
            });
        }
        Ok(KeySetDocument { revision: 0, keys })
    }

    async fn contains_key(&self, kid: &str) -> anyhow::Result<bool> {
        Ok(self.keys.contains_key(kid))
    }

    async fn delete_key(&self, kid: &str) -> anyhow::Result<bool> {
        Ok(self.keys.remove(kid).is_some())
    }
}
