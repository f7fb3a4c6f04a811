use std::sync::Arc;

use async_trait::async_trait;
use epuctl_bus::{AgentHeartbeat, BusError, BusHandler, DispatchRequest};
use epuctl_domain::{InstanceId, Upid};
use serde::Deserialize;
use serde_json::Value;

use crate::core::PdCore;
use crate::error::PdError;

/// Bus name the dispatcher registers under by default.
pub const SERVICE_NAME: &str = "pd";

/// Thin RPC adapter over [`PdCore`].
pub struct PdService {
    core: Arc<PdCore>,
}

impl PdService {
    pub fn new(core: Arc<PdCore>) -> Self {
        PdService { core }
    }
}

fn remote(operation: &str, e: PdError) -> BusError {
    BusError::Remote {
        name: SERVICE_NAME.to_string(),
        operation: operation.to_string(),
        message: e.to_string(),
    }
}

#[derive(Deserialize)]
struct UpidArgs {
    upid: Upid,
}

#[derive(Deserialize)]
struct NodeArgs {
    node_id: InstanceId,
}

#[async_trait]
impl BusHandler for PdService {
    async fn handle(&self, operation: &str, payload: Value) -> Result<Value, BusError> {
        match operation {
            "dispatch_process" => {
                let request: DispatchRequest = serde_json::from_value(payload)?;
                let record = self
                    .core
                    .dispatch_process(&request)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(serde_json::to_value(record)?)
            }
            "terminate_process" => {
                let args: UpidArgs = serde_json::from_value(payload)?;
                let record = self
                    .core
                    .terminate_process(&args.upid)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(serde_json::to_value(record)?)
            }
            "restart_process" => {
                let args: UpidArgs = serde_json::from_value(payload)?;
                let record = self
                    .core
                    .restart_process(&args.upid)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(serde_json::to_value(record)?)
            }
            "describe_process" => {
                let args: UpidArgs = serde_json::from_value(payload)?;
                let record = self
                    .core
                    .describe_process(&args.upid)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(serde_json::to_value(record)?)
            }
            "describe_processes" => {
                let records =
                    self.core.describe_processes().await.map_err(|e| remote(operation, e))?;
                Ok(serde_json::to_value(records)?)
            }
            "evacuate_node" => {
                let args: NodeArgs = serde_json::from_value(payload)?;
                self.core
                    .evacuate_node(&args.node_id)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "heartbeat" => {
                let heartbeat: AgentHeartbeat = serde_json::from_value(payload)?;
                self.core.heartbeat(&heartbeat).await.map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            other => Err(BusError::UnknownOperation {
                name: SERVICE_NAME.to_string(),
                operation: other.to_string(),
            }),
        }
    }
}
