use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no such bus name: {0}")]
    UnknownTarget(String),

    #[error("{name} does not handle operation '{operation}'")]
    UnknownOperation { name: String, operation: String },

    #[error("call to {name}.{operation} timed out after {secs}s")]
    Timeout { name: String, operation: String, secs: u64 },

    /// The remote handler failed; carries its rendered error.
    #[error("remote error from {name}.{operation}: {message}")]
    Remote { name: String, operation: String, message: String },

    #[error("bad payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl BusError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }
}
