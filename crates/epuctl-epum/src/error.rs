use thiserror::Error;

#[derive(Debug, Error)]
pub enum EpumError {
    #[error("domain already exists: {0}")]
    DomainExists(String),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("unknown decision engine: {0}")]
    UnknownDecisionEngine(String),

    #[error("invalid domain config: {0}")]
    InvalidConfig(String),

    #[error("domain error: {0}")]
    Domain(#[from] epuctl_domain::DomainError),

    #[error("store error: {0}")]
    Store(#[from] epuctl_store::StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] epuctl_bus::BusError),
}
