pub mod doer;
pub mod engine;
pub mod error;
pub mod manager;
pub mod service;
pub mod simplest;

pub use doer::run_epum_doer;
pub use engine::{Action, DecisionEngine, DecisionEngineRegistry, DomainView};
pub use error::EpumError;
pub use manager::EpuManagement;
pub use service::EpumService;
pub use simplest::SimplestEngine;
