use std::sync::Arc;

use async_trait::async_trait;
use epuctl_bus::{BusError, BusHandler};
use epuctl_domain::SiteId;
use serde::Deserialize;
use serde_json::Value;

use crate::error::DtrsError;
use crate::registry::{DtDefinition, DtRegistry};

/// Bus name the registry answers on by default.
pub const SERVICE_NAME: &str = "dtrs";

/// Thin RPC adapter over a [`DtRegistry`].
pub struct DtrsService {
    registry: Arc<dyn DtRegistry>,
}

impl DtrsService {
    pub fn new(registry: Arc<dyn DtRegistry>) -> Self {
        DtrsService { registry }
    }
}

fn remote(operation: &str, e: DtrsError) -> BusError {
    BusError::Remote {
        name: SERVICE_NAME.to_string(),
        operation: operation.to_string(),
        message: e.to_string(),
    }
}

#[derive(Deserialize)]
struct DtArgs {
    caller: String,
    dt_name: String,
    definition: Option<Value>,
}

#[derive(Deserialize)]
struct SiteArgs {
    site: String,
    definition: Option<Value>,
}

#[derive(Deserialize)]
struct CredentialArgs {
    caller: String,
    site: String,
    credentials: Value,
}

#[async_trait]
impl BusHandler for DtrsService {
    async fn handle(&self, operation: &str, payload: Value) -> Result<Value, BusError> {
        match operation {
            "add_dt" => {
                let args: DtArgs = serde_json::from_value(payload)?;
                let definition: DtDefinition =
                    serde_json::from_value(args.definition.unwrap_or(Value::Null))?;
                self.registry
                    .add_dt(&args.caller, &args.dt_name, definition)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "describe_dt" => {
                let args: DtArgs = serde_json::from_value(payload)?;
                let definition = self
                    .registry
                    .describe_dt(&args.caller, &args.dt_name)
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(serde_json::to_value(definition)?)
            }
            "add_site" => {
                let args: SiteArgs = serde_json::from_value(payload)?;
                self.registry
                    .add_site(&SiteId::new(&args.site), args.definition.unwrap_or(Value::Null))
                    .await
                    .map_err(|e| remote(operation, e))?;
                Ok(Value::Null)
            }
            "describe_site" => {
                let args: SiteArgs = serde_json::from_value(payload)?;
                self.registry
                    .describe_site(&SiteId::new(&args.site))
                    .await
                    .map_err(|e| remote(operation, e))
            }
            "add_credentials" => {
                let args: CredentialArgs = serde_json::from_value(payload)?;
                self.registry
                    .add_credentials(&args.caller, &SiteId::new(&args.site), args.credentials)
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
