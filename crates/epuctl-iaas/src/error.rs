use thiserror::Error;

#[derive(Debug, Error)]
pub enum IaasError {
    #[error("node creation failed: {0}")]
    CreateFailed(String),

    #[error("unknown iaas node: {0}")]
    NotFound(String),

    #[error("iaas {op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },

    /// Throttling or backend hiccup; retry with backoff.
    #[error("transient iaas error: {0}")]
    Transient(String),

    /// Operator intervention required.
    #[error("invalid iaas credentials: {0}")]
    InvalidCredentials(String),

    /// Operator intervention required.
    #[error("iaas quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("no driver registered for site: {0}")]
    SiteNotConfigured(String),
}

impl IaasError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IaasError::Timeout { .. } | IaasError::Transient(_))
    }
}
