//! Wire payloads shared between clients and service adapters.

use chrono::{DateTime, Utc};
use epuctl_domain::{
    DomainId, EngineId, InstanceId, LaunchId, ProcessConstraints, ResourceId, RestartPolicy,
    SiteId, Subscriber, Upid,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `provisioner.provision` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub launch_id: LaunchId,
    /// Autoscale domain this launch belongs to, when the EPUM is the caller.
    pub domain_id: Option<DomainId>,
    pub deployable_type: String,
    pub instance_ids: Vec<InstanceId>,
    pub subscribers: Vec<Subscriber>,
    pub site: Option<SiteId>,
    pub allocation: Option<String>,
    pub vars: Option<Map<String, Value>>,
    /// Defaults to the configured default user.
    pub caller: Option<String>,
}

/// `pd.dispatch_process` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub upid: Upid,
    /// Forwarded verbatim to the agent.
    pub definition: Value,
    #[serde(default)]
    pub constraints: ProcessConstraints,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub subscribers: Vec<Subscriber>,
}

/// What an EEAgent reports about one process it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProcess {
    pub upid: Upid,
    pub round: u32,
    pub status: AgentProcessStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AgentProcessStatus {
    Running,
    Exited { code: i32 },
    Error,
}

/// Periodic EEAgent heartbeat: advertised slots plus the state of every
/// process the agent holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub resource_id: ResourceId,
    pub node_id: InstanceId,
    /// Absent on agents that predate engine tagging; the dispatcher then
    /// resolves the engine through the node record.
    pub engine_id: Option<EngineId>,
    pub slot_count: u32,
    #[serde(default)]
    pub processes: Vec<AgentProcess>,
    pub timestamp: Option<DateTime<Utc>>,
}
