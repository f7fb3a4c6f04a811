//! Typed clients over the message bus, one per RPC surface.
//!
//! Each wraps `name.operation(args)` wiring so callers and tests never
//! build raw payloads. Mutating operations are RPC; heartbeats and
//! state-change intake are one-way.

use std::sync::Arc;

use epuctl_domain::{DomainId, InstanceId, InstanceRecord, LaunchId, ProcessRecord, Subscriber, Upid};
use serde_json::{json, Value};

use crate::bus::MessageBus;
use crate::error::BusError;
use crate::messages::{AgentHeartbeat, DispatchRequest, ProvisionRequest};

#[derive(Clone)]
pub struct ProvisionerClient {
    bus: Arc<dyn MessageBus>,
    name: String,
}

impl ProvisionerClient {
    pub fn new(bus: Arc<dyn MessageBus>, name: impl Into<String>) -> Self {
        ProvisionerClient { bus, name: name.into() }
    }

    pub async fn provision(&self, request: &ProvisionRequest) -> Result<(), BusError> {
        self.bus
            .call(&self.name, "provision", serde_json::to_value(request)?)
            .await?;
        Ok(())
    }

    pub async fn terminate_launches(&self, launch_ids: &[LaunchId]) -> Result<(), BusError> {
        self.bus
            .call(&self.name, "terminate_launches", json!({ "launch_ids": launch_ids }))
            .await?;
        Ok(())
    }

    pub async fn terminate_nodes(&self, node_ids: &[InstanceId]) -> Result<(), BusError> {
        self.bus
            .call(&self.name, "terminate_nodes", json!({ "node_ids": node_ids }))
            .await?;
        Ok(())
    }

    pub async fn terminate_all(&self) -> Result<bool, BusError> {
        let reply = self.bus.call(&self.name, "terminate_all", Value::Null).await?;
        Ok(reply["complete"].as_bool().unwrap_or(false))
    }

    pub async fn describe_nodes(
        &self,
        node_ids: Option<&[InstanceId]>,
    ) -> Result<Vec<InstanceRecord>, BusError> {
        let payload = match node_ids {
            Some(ids) => json!({ "node_ids": ids }),
            None => Value::Null,
        };
        let reply = self.bus.call(&self.name, "describe_nodes", payload).await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn dump_state(
        &self,
        node_ids: &[InstanceId],
        force_subscribe: Option<&Subscriber>,
    ) -> Result<(), BusError> {
        self.bus
            .call(
                &self.name,
                "dump_state",
                json!({ "node_ids": node_ids, "force_subscribe": force_subscribe }),
            )
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct EpumClient {
    bus: Arc<dyn MessageBus>,
    name: String,
}

impl EpumClient {
    pub fn new(bus: Arc<dyn MessageBus>, name: impl Into<String>) -> Self {
        EpumClient { bus, name: name.into() }
    }

    pub async fn add_domain(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
        config: Value,
    ) -> Result<(), BusError> {
        self.bus
            .call(
                &self.name,
                "add_domain",
                json!({ "owner": owner, "domain_id": domain_id, "config": config }),
            )
            .await?;
        Ok(())
    }

    pub async fn remove_domain(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
    ) -> Result<(), BusError> {
        self.bus
            .call(
                &self.name,
                "remove_domain",
                json!({ "owner": owner, "domain_id": domain_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn reconfigure_domain(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
        patch: Value,
    ) -> Result<(), BusError> {
        self.bus
            .call(
                &self.name,
                "reconfigure_domain",
                json!({ "owner": owner, "domain_id": domain_id, "config": patch }),
            )
            .await?;
        Ok(())
    }

    pub async fn list_domains(&self, owner: Option<&str>) -> Result<Vec<DomainId>, BusError> {
        let reply = self
            .bus
            .call(&self.name, "list_domains", json!({ "owner": owner }))
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Domain record plus its instances, as one JSON document.
    pub async fn describe_domain(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
    ) -> Result<Value, BusError> {
        self.bus
            .call(
                &self.name,
                "describe_domain",
                json!({ "owner": owner, "domain_id": domain_id }),
            )
            .await
    }

    pub async fn subscribe_domain(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
        subscriber: &Subscriber,
    ) -> Result<(), BusError> {
        self.bus
            .call(
                &self.name,
                "subscribe_dt",
                json!({ "owner": owner, "domain_id": domain_id, "subscriber": subscriber }),
            )
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_domain(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
        subscriber_name: &str,
    ) -> Result<(), BusError> {
        self.bus
            .call(
                &self.name,
                "unsubscribe_dt",
                json!({ "owner": owner, "domain_id": domain_id, "subscriber_name": subscriber_name }),
            )
            .await?;
        Ok(())
    }

    /// EEAgent liveness relay, one-way.
    pub async fn heartbeat(&self, heartbeat: &AgentHeartbeat) -> Result<(), BusError> {
        self.bus
            .fire(&self.name, "heartbeat", serde_json::to_value(heartbeat)?)
            .await
    }

    /// Provisioner state-change intake, one-way.
    pub async fn instance_info(&self, record: Value) -> Result<(), BusError> {
        self.bus.fire(&self.name, "instance_info", record).await
    }

    /// Sensor sample intake, one-way.
    pub async fn sensor_info(&self, payload: Value) -> Result<(), BusError> {
        self.bus.fire(&self.name, "sensor_info", payload).await
    }
}

#[derive(Clone)]
pub struct PdClient {
    bus: Arc<dyn MessageBus>,
    name: String,
}

impl PdClient {
    pub fn new(bus: Arc<dyn MessageBus>, name: impl Into<String>) -> Self {
        PdClient { bus, name: name.into() }
    }

    pub async fn dispatch_process(
        &self,
        request: &DispatchRequest,
    ) -> Result<ProcessRecord, BusError> {
        let reply = self
            .bus
            .call(&self.name, "dispatch_process", serde_json::to_value(request)?)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn terminate_process(&self, upid: &Upid) -> Result<ProcessRecord, BusError> {
        let reply = self
            .bus
            .call(&self.name, "terminate_process", json!({ "upid": upid }))
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn restart_process(&self, upid: &Upid) -> Result<ProcessRecord, BusError> {
        let reply = self
            .bus
            .call(&self.name, "restart_process", json!({ "upid": upid }))
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn describe_process(&self, upid: &Upid) -> Result<Option<ProcessRecord>, BusError> {
        let reply = self
            .bus
            .call(&self.name, "describe_process", json!({ "upid": upid }))
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn describe_processes(&self) -> Result<Vec<ProcessRecord>, BusError> {
        let reply = self.bus.call(&self.name, "describe_processes", Value::Null).await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn evacuate_node(&self, node_id: &InstanceId) -> Result<(), BusError> {
        self.bus
            .call(&self.name, "evacuate_node", json!({ "node_id": node_id }))
            .await?;
        Ok(())
    }

    /// EEAgent heartbeat, one-way.
    pub async fn heartbeat(&self, heartbeat: &AgentHeartbeat) -> Result<(), BusError> {
        self.bus
            .fire(&self.name, "heartbeat", serde_json::to_value(heartbeat)?)
            .await
    }
}

#[derive(Clone)]
pub struct DtrsClient {
    bus: Arc<dyn MessageBus>,
    name: String,
}

impl DtrsClient {
    pub fn new(bus: Arc<dyn MessageBus>, name: impl Into<String>) -> Self {
        DtrsClient { bus, name: name.into() }
    }

    pub async fn add_dt(
        &self,
        caller: &str,
        dt_name: &str,
        definition: Value,
    ) -> Result<(), BusError> {
        self.bus
            .call(
                &self.name,
                "add_dt",
                json!({ "caller": caller, "dt_name": dt_name, "definition": definition }),
            )
            .await?;
        Ok(())
    }

    pub async fn describe_dt(&self, caller: &str, dt_name: &str) -> Result<Value, BusError> {
        self.bus
            .call(&self.name, "describe_dt", json!({ "caller": caller, "dt_name": dt_name }))
            .await
    }

    pub async fn add_site(&self, site: &str, definition: Value) -> Result<(), BusError> {
        self.bus
            .call(&self.name, "add_site", json!({ "site": site, "definition": definition }))
            .await?;
        Ok(())
    }

    pub async fn describe_site(&self, site: &str) -> Result<Value, BusError> {
        self.bus.call(&self.name, "describe_site", json!({ "site": site })).await
    }

    pub async fn add_credentials(
        &self,
        caller: &str,
        site: &str,
        credentials: Value,
    ) -> Result<(), BusError> {
        self.bus
            .call(
                &self.name,
                "add_credentials",
                json!({ "caller": caller, "site": site, "credentials": credentials }),
            )
            .await?;
        Ok(())
    }
}
