pub mod agents;
pub mod core;
pub mod doer;
pub mod error;
pub mod matchmaker;
pub mod service;

pub use agents::{BusAgentClient, EeAgentClient, RecordingAgentClient};
pub use crate::core::PdCore;
pub use doer::run_pd_doer;
pub use error::PdError;
pub use matchmaker::{choose_resource, compute_need};
pub use service::PdService;
