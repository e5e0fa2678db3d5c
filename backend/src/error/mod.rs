use thiserror::Error;

/// Write conflicts the durable tier reports when a concurrent writer changed
/// the entry between our read and our merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The entry no longer carries the attribute values we based the write on.
    NoSuchAttribute,
    /// The attribute value we tried to add is already present.
    AttributeOrValueExists,
    /// Any other conflict class; never retried.
    Other,
}

impl ConflictKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ConflictKind::NoSuchAttribute | ConflictKind::AttributeOrValueExists
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict: {0:?}")]
    Conflict(ConflictKind),
    #[error("entry not found: {0}")]
    NotFound(String),
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("failed to (de)serialize entry: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn retryable_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(kind) if kind.is_retryable())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session entry update failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: StoreError,
    },
    #[error("invalid session state: {0}")]
    InvalidSessionState(String),
    #[error("failed to compute session state: {0}")]
    SessionState(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_attribute_conflicts_are_retryable() {
        assert!(StoreError::Conflict(ConflictKind::NoSuchAttribute).retryable_conflict());
        assert!(StoreError::Conflict(ConflictKind::AttributeOrValueExists).retryable_conflict());
        assert!(!StoreError::Conflict(ConflictKind::Other).retryable_conflict());
        assert!(!StoreError::Cache("down".into()).retryable_conflict());
    }

    #[test]
    fn retries_exhausted_reports_attempts() {
        let err = SessionError::RetriesExhausted {
            attempts: 3,
            last: StoreError::Conflict(ConflictKind::NoSuchAttribute),
        };
        assert_eq!(err.to_string(), "session entry update failed after 3 attempts");
    }
}
