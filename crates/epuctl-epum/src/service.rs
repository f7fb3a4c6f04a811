use std::sync::Arc;

use async_trait::async_trait;
use epuctl_bus::{AgentHeartbeat, BusError, BusHandler};
use epuctl_domain::{DomainId, Subscriber};
use serde::Deserialize;
use serde_json::Value;

use crate::error::EpumError;
use crate::manager::EpuManagement;

/// Bus name the EPUM registers under by default.
pub const SERVICE_NAME: &str = "epum";

/// Thin RPC adapter over [`EpuManagement`].
pub struct EpumService {
    manager: Arc<EpuManagement>,
}

impl EpumService {
    pub fn new(manager: Arc<EpuManagement>) -> Self {
        EpumService { manager }
    }
}

fn remote(operation: &str, e: EpumError) -> BusError {
    BusError::Remote {
        name: SERVICE_NAME.to_string(),
        operation: operation.to_string(),
        message: e.to_string(),
    }
}

#[derive(Deserialize)]
struct DomainArgs {
    owner: Option<String>,
    domain_id: DomainId,
    config: Option<Value>,
}

#[derive(Deserialize)]
struct OwnerArgs {
    owner: Option<String>,
}

#[derive(Deserialize)]
struct SubscribeArgs {
    owner: Option<String>,
    domain_id: DomainId,
    subscriber: Option<Subscriber>,
    subscriber_name: Option<String>,
}

#[async_trait]
impl BusHandler for EpumService {
    async fn handle(&self, operation: &str, payload: Value) -> Result<Value, BusError> {
        match operation {
            "add_domain" => {
                let args: DomainArgs = serde_json::from_value(payload)?;
                let config = args.config.unwrap_or(Value::Null);
                self.manager
                    .add_domain(args.owner.as_deref(), &args.domain_id, config)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "remove_domain" => {
                let args: DomainArgs = serde_json::from_value(payload)?;
                self.manager
                    .remove_domain(args.owner.as_deref(), &args.domain_id)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "reconfigure_domain" => {
                let args: DomainArgs = serde_json::from_value(payload)?;
                let patch = args.config.unwrap_or(Value::Null);
                self.manager
                    .reconfigure_domain(args.owner.as_deref(), &args.domain_id, patch)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "list_domains" => {
                let args: OwnerArgs = serde_json::from_value(payload)?;
                let domains = self
                    .manager
                    .list_domains(args.owner.as_deref())
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(serde_json::to_value(domains)?)
            }
            "describe_domain" => {
                let args: DomainArgs = serde_json::from_value(payload)?;
                self.manager
                    .describe_domain(args.owner.as_deref(), &args.domain_id)
                    .await
                    .map_err(|e| remote(operation, e))
            }
            "subscribe_dt" => {
                let args: SubscribeArgs = serde_json::from_value(payload)?;
                let subscriber = args.subscriber.ok_or_else(|| BusError::Remote {
                    name: SERVICE_NAME.to_string(),
                    operation: operation.to_string(),
                    message: "subscriber is required".to_string(),
                })?;
                self.manager
                    .subscribe(args.owner.as_deref(), &args.domain_id, subscriber)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "unsubscribe_dt" => {
                let args: SubscribeArgs = serde_json::from_value(payload)?;
                let name = args.subscriber_name.ok_or_else(|| BusError::Remote {
                    name: SERVICE_NAME.to_string(),
                    operation: operation.to_string(),
                    message: "subscriber_name is required".to_string(),
                })?;
                self.manager
                    .unsubscribe(args.owner.as_deref(), &args.domain_id, &name)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "heartbeat" => {
                let heartbeat: AgentHeartbeat = serde_json::from_value(payload)?;
                self.manager.heartbeat(&heartbeat).await.map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "instance_info" => {
                self.manager.instance_info(payload).await.map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "sensor_info" => {
                self.manager.sensor_info(payload).await.map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            other => Err(BusError::UnknownOperation {
                name: SERVICE_NAME.to_string(),
                operation: other.to_string(),
            }),
        }
    }
}
