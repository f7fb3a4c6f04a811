use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdError {
    /// Same upid, different definition. A replay with the identical
    /// definition is accepted instead.
    #[error("process already exists with a different definition: {0}")]
    ProcessConflict(String),

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("domain error: {0}")]
    Domain(#[from] epuctl_domain::DomainError),

    #[error("store error: {0}")]
    Store(#[from] epuctl_store::StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] epuctl_bus::BusError),
}
