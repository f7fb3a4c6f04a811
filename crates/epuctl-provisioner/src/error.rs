use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionerError {
    /// Malformed request; almost certainly a client programming error.
    #[error("invalid provision request: {0}")]
    InvalidRequest(String),

    /// A terminate-all sweep is draining; new launches are rejected until
    /// it completes.
    #[error("terminate-all in progress, rejecting new launches")]
    Draining,

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("store error: {0}")]
    Store(#[from] epuctl_store::StoreError),
}
