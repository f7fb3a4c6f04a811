use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{DomainId, EngineId, InstanceId, LaunchId, ResourceId, SiteId, Upid};
use crate::states::{InstanceState, ProcessState};

/// A message-bus recipient for record state changes: the bus name and the
/// operation invoked on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscriber {
    pub name: String,
    pub operation: String,
}

impl Subscriber {
    pub fn new(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Subscriber { name: name.into(), operation: operation.into() }
    }
}

impl std::fmt::Display for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.name, self.operation)
    }
}

// ── Launches & instances ──────────────────────────────────────────────────────

/// A group of instances created together. One launch may span multiple
/// nodes, but a node belongs to exactly one launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub launch_id: LaunchId,
    pub domain_id: Option<DomainId>,
    pub deployable_type: String,
    pub subscribers: Vec<Subscriber>,
    pub state: InstanceState,
    pub state_desc: Option<String>,
    pub node_ids: Vec<InstanceId>,
    pub creator: Option<String>,
    /// Unknown wire fields, preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Instance liveness as judged from EEAgent heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceHealth {
    #[default]
    Unknown,
    Ok,
    Missing,
}

/// One VM. Created by the provisioner, mutated on heartbeat or IaaS query,
/// terminal at `TERMINATED`, `FAILED` or `REJECTED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub launch_id: LaunchId,
    pub domain_id: Option<DomainId>,
    pub site: SiteId,
    pub allocation: Option<String>,
    pub iaas_image: Option<String>,
    pub deployable_type: Option<String>,
    pub state: InstanceState,
    pub state_desc: Option<String>,
    /// Unique within the site, when set.
    pub iaas_id: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    #[serde(default)]
    pub health: InstanceHealth,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub pending_timestamp: Option<DateTime<Utc>>,
    pub running_timestamp: Option<DateTime<Utc>>,
    pub terminated_timestamp: Option<DateTime<Utc>>,
    pub creator: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InstanceRecord {
    pub fn new(
        instance_id: InstanceId,
        launch_id: LaunchId,
        site: SiteId,
        state: InstanceState,
    ) -> Self {
        InstanceRecord {
            instance_id,
            launch_id,
            domain_id: None,
            site,
            allocation: None,
            iaas_image: None,
            deployable_type: None,
            state,
            state_desc: None,
            iaas_id: None,
            public_ip: None,
            private_ip: None,
            health: InstanceHealth::Unknown,
            last_heartbeat: None,
            pending_timestamp: None,
            running_timestamp: None,
            terminated_timestamp: None,
            creator: None,
            extra: Map::new(),
        }
    }
}

// ── Domains ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    #[default]
    New,
    Running,
    Removed,
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DomainState::New => "new",
            DomainState::Running => "running",
            DomainState::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

/// One autoscale group governed by a decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub domain_id: DomainId,
    pub owner: String,
    pub engine_id: EngineId,
    /// Class-name string selecting the decision engine implementation.
    pub decision_engine: String,
    /// Engine configuration, merged by `reconfigure_domain`.
    pub config: Value,
    #[serde(default)]
    pub state: DomainState,
    #[serde(default)]
    pub monitor_health: bool,
    pub subscribers: Vec<Subscriber>,
    /// Latest sensor samples keyed by sensor id.
    #[serde(default)]
    pub sensor_data: HashMap<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Processes & resources ─────────────────────────────────────────────────────

/// What the matchmaker does with a process whose agent died or whose run
/// ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestartPolicy {
    #[default]
    Always,
    OnExitOnly,
    Never,
}

/// Placement constraints. Opaque hardware predicates travel in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessConstraints {
    pub engine_id: Option<EngineId>,
    pub host: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A unit of work placed onto an execution-engine agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub upid: Upid,
    /// Forwarded verbatim to the agent; the matchmaker only reads constraints.
    pub definition: Value,
    pub state: ProcessState,
    #[serde(default)]
    pub constraints: ProcessConstraints,
    pub assigned_resource: Option<ResourceId>,
    /// Incremented each time the process is relaunched.
    #[serde(default)]
    pub round: u32,
    pub restarts_remaining: u32,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub priority: u8,
    pub enqueued_at: Option<DateTime<Utc>>,
    /// Ticks this process stayed queued with no feasible resource.
    #[serde(default)]
    pub starved_rounds: u32,
    pub subscribers: Vec<Subscriber>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One position in a per-priority FIFO dispatch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub upid: Upid,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
}

/// One EEAgent's advertised slots. Created on first heartbeat, disabled and
/// reaped on death.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: ResourceId,
    pub node_id: InstanceId,
    pub engine_id: EngineId,
    pub slot_count: u32,
    pub assigned: Vec<Upid>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl ResourceRecord {
    pub fn free_slots(&self) -> u32 {
        self.slot_count.saturating_sub(self.assigned.len() as u32)
    }
}
