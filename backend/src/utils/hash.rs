use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `value`.
pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Storage key of a raw token. Raw token values are never persisted.
pub fn hash_token(token: &str) -> String {
    sha256_hex(token)
}
