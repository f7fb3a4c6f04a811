use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use epuctl_bus::{BusError, MessageBus};
use epuctl_domain::{ProcessRecord, ResourceId, Upid};
use serde_json::json;

/// Outbound calls to execution-engine agents. The process definition is
/// forwarded verbatim; the dispatcher never inspects it.
#[async_trait]
pub trait EeAgentClient: Send + Sync + 'static {
    async fn launch_process(
        &self,
        resource_id: &ResourceId,
        process: &ProcessRecord,
    ) -> Result<(), BusError>;

    async fn terminate_process(
        &self,
        resource_id: &ResourceId,
        upid: &Upid,
    ) -> Result<(), BusError>;
}

/// [`EeAgentClient`] over the message bus. Each agent answers on a bus
/// name derived from its resource id.
pub struct BusAgentClient {
    bus: Arc<dyn MessageBus>,
    name_prefix: String,
}

impl BusAgentClient {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        BusAgentClient { bus, name_prefix: "eeagent".to_string() }
    }

    fn agent_name(&self, resource_id: &ResourceId) -> String {
        format!("{}.{}", self.name_prefix, resource_id)
    }
}

#[async_trait]
impl EeAgentClient for BusAgentClient {
    async fn launch_process(
        &self,
        resource_id: &ResourceId,
        process: &ProcessRecord,
    ) -> Result<(), BusError> {
        let payload = json!({
            "upid": &process.upid,
            "round": process.round,
            "definition": &process.definition,
        });
        self.bus.fire(&self.agent_name(resource_id), "launch_process", payload).await
    }

    async fn terminate_process(
        &self,
        resource_id: &ResourceId,
        upid: &Upid,
    ) -> Result<(), BusError> {
        self.bus
            .fire(&self.agent_name(resource_id), "terminate_process", json!({ "upid": upid }))
            .await
    }
}

/// Test agent client capturing every call.
#[derive(Clone, Default)]
pub struct RecordingAgentClient {
    launches: Arc<Mutex<Vec<(ResourceId, Upid, u32)>>>,
    terminations: Arc<Mutex<Vec<(ResourceId, Upid)>>>,
}

impl RecordingAgentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<(ResourceId, Upid, u32)> {
        self.launches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn terminations(&self) -> Vec<(ResourceId, Upid)> {
        self.terminations.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EeAgentClient for RecordingAgentClient {
    async fn launch_process(
        &self,
        resource_id: &ResourceId,
        process: &ProcessRecord,
    ) -> Result<(), BusError> {
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((resource_id.clone(), process.upid.clone(), process.round));
        Ok(())
    }

    async fn terminate_process(
        &self,
        resource_id: &ResourceId,
        upid: &Upid,
    ) -> Result<(), BusError> {
        self.terminations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((resource_id.clone(), upid.clone()));
        Ok(())
    }
}
