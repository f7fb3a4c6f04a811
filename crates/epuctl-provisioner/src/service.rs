use std::sync::Arc;

use async_trait::async_trait;
use epuctl_bus::{BusError, BusHandler, ProvisionRequest};
use epuctl_domain::{InstanceId, LaunchId, Subscriber};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::ProvisionerCore;
use crate::error::ProvisionerError;

/// Bus name the provisioner registers under by default.
pub const SERVICE_NAME: &str = "provisioner";

/// Thin RPC adapter over [`ProvisionerCore`].
pub struct ProvisionerService {
    core: Arc<ProvisionerCore>,
}

impl ProvisionerService {
    pub fn new(core: Arc<ProvisionerCore>) -> Self {
        ProvisionerService { core }
    }
}

fn remote(operation: &str, e: ProvisionerError) -> BusError {
    BusError::Remote {
        name: SERVICE_NAME.to_string(),
        operation: operation.to_string(),
        message: e.to_string(),
    }
}

#[derive(Deserialize)]
struct LaunchIdsArgs {
    launch_ids: Vec<LaunchId>,
}

#[derive(Deserialize)]
struct NodeIdsArgs {
    node_ids: Vec<InstanceId>,
}

#[derive(Deserialize)]
struct DumpStateArgs {
    node_ids: Vec<InstanceId>,
    force_subscribe: Option<Subscriber>,
}

#[async_trait]
impl BusHandler for ProvisionerService {
    async fn handle(&self, operation: &str, payload: Value) -> Result<Value, BusError> {
        match operation {
            "provision" => {
                let request: ProvisionRequest = serde_json::from_value(payload)?;
                self.core.provision(&request).await.map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "terminate_launches" => {
                let args: LaunchIdsArgs = serde_json::from_value(payload)?;
                self.core
                    .terminate_launches(&args.launch_ids)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "terminate_nodes" => {
                let args: NodeIdsArgs = serde_json::from_value(payload)?;
                self.core
                    .mark_nodes_terminating(&args.node_ids)
                    .await
                    .map_err(|e| remote(operation, e))?;
                self.core
                    .terminate_nodes(&args.node_ids)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "terminate_all" => {
                let complete =
                    self.core.terminate_all().await.map_err(|e| remote(operation, e))?;
                Ok(json!({ "complete": complete }))
            }
            "describe_nodes" => {
                let node_ids: Option<Vec<InstanceId>> = match payload {
                    Value::Null => None,
                    other => {
                        let args: NodeIdsArgs = serde_json::from_value(other)?;
                        Some(args.node_ids)
                    }
                };
                let nodes = self
                    .core
                    .describe_nodes(node_ids.as_deref())
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(serde_json::to_value(nodes)?)
            }
            "dump_state" => {
                let args: DumpStateArgs = serde_json::from_value(payload)?;
                self.core
                    .dump_state(&args.node_ids, args.force_subscribe.as_ref())
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            other => Err(BusError::UnknownOperation {
                name: SERVICE_NAME.to_string(),
                operation: other.to_string(),
            }),
        }
    }
}
