use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw YAML representation of the control-plane config file.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawConfig {
    /// "memory" (default) or "coordination".
    pub persistence_type: Option<String>,
    #[serde(default)]
    pub coordination_hosts: Vec<String>,
    pub coordination_path: Option<String>,
    pub default_user: Option<String>,
    /// Seconds without an EEAgent heartbeat before an instance is `Missing`.
    pub heartbeat_timeout: Option<u64>,
    /// Seconds without a heartbeat before an agent resource is expired.
    pub agent_timeout: Option<u64>,
    /// Doer loop tick interval in seconds.
    pub tick_interval: Option<u64>,
    /// Seconds a deposed leader has to stop writing.
    pub leader_grace: Option<u64>,
    pub max_restarts: Option<u32>,
    pub replica_count: Option<u32>,
    pub default_site: Option<String>,
    /// Engine id that unknown engine lookups fall back to.
    pub default_engine: Option<String>,
    #[serde(default)]
    pub engines: HashMap<String, RawEngine>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawEngine {
    pub deployable_type: String,
    pub slots: u32,
    pub replicas: Option<u32>,
    pub spare_slots: Option<u32>,
    pub base_need: Option<u32>,
    pub iaas_allocation: Option<String>,
    pub maximum_vms: Option<u32>,
}
