pub mod engines;
pub mod error;
pub mod ids;
pub mod records;
pub mod states;

#[cfg(test)]
mod tests;

pub use engines::{
    domain_id_from_engine, engine_id_from_domain, EngineRegistry, EngineSpec, DOMAIN_PREFIX,
};
pub use error::DomainError;
pub use ids::{DomainId, EngineId, InstanceId, LaunchId, ResourceId, SiteId, Upid};
pub use records::{
    DomainRecord, DomainState, InstanceHealth, InstanceRecord, LaunchRecord, ProcessConstraints,
    ProcessRecord, QueueEntry, ResourceRecord, RestartPolicy, Subscriber,
};
pub use states::{InstanceState, ProcessState};
