//! The persistent layout. Everything the control plane stores lives under
//! one of these prefixes.

use epuctl_domain::{DomainId, EngineId, InstanceId, LaunchId, ResourceId, Upid};

pub const LAUNCHES: &str = "/launches";
pub const NODES: &str = "/nodes";
pub const DOMAINS: &str = "/domains";
pub const RESOURCES: &str = "/resources";
pub const PROCESSES: &str = "/processes";
pub const QUEUES: &str = "/queues";
pub const LEADERS: &str = "/leaders";
pub const AGENTS: &str = "/agents";

pub fn launch(id: &LaunchId) -> String {
    format!("{}/{}", LAUNCHES, id)
}

pub fn node(id: &InstanceId) -> String {
    format!("{}/{}", NODES, id)
}

pub fn domain(owner: &str, id: &DomainId) -> String {
    format!("{}/{}/{}", DOMAINS, owner, id)
}

// Trailing slash so "bob" does not also match "bobby".
pub fn domain_owner_prefix(owner: &str) -> String {
    format!("{}/{}/", DOMAINS, owner)
}

pub fn resource(id: &ResourceId) -> String {
    format!("{}/{}", RESOURCES, id)
}

pub fn process(upid: &Upid) -> String {
    format!("{}/{}", PROCESSES, upid)
}

pub fn queue(engine: &EngineId, priority: u8) -> String {
    format!("{}/{}/{}", QUEUES, engine, priority)
}

pub fn queue_engine_prefix(engine: &EngineId) -> String {
    format!("{}/{}/", QUEUES, engine)
}

pub fn leader(role: &str) -> String {
    format!("{}/{}", LEADERS, role)
}

pub fn agent(id: &ResourceId) -> String {
    format!("{}/{}", AGENTS, id)
}
