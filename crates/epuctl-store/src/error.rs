use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// CAS lost: the caller retries its read-modify-write.
    #[error("version conflict at {path}: expected {expected}")]
    Conflict { path: String, expected: u64 },

    #[error("path not found: {0}")]
    NotFound(String),

    /// Transient backend failure; the operation may be retried.
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Too many CAS retries; somebody else keeps winning the record.
    #[error("gave up updating {path} after {attempts} conflicts")]
    RetriesExhausted { path: String, attempts: u32 },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Backend(_))
    }
}
