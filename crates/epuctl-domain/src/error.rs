use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown engine: {0}")]
    EngineUnknown(String),

    #[error("engine {0} already in registry")]
    DuplicateEngine(String),

    #[error("invalid engine spec for {engine_id}: {message}")]
    InvalidEngineSpec { engine_id: String, message: String },

    #[error("invalid domain id: {0}")]
    InvalidDomainId(String),

    #[error("invalid engine id: {0}")]
    InvalidEngineId(String),

    #[error("unknown state: {0}")]
    UnknownState(String),

    #[error("illegal state transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}
