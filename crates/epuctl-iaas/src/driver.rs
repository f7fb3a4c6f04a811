use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use epuctl_domain::{InstanceId, InstanceState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IaasError;

/// What the provisioner hands a driver to create one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// The instance id the control plane tracks this VM under. Drivers may
    /// use it as an idempotency token.
    pub node_id: InstanceId,
    pub image: Option<String>,
    pub allocation: Option<String>,
    /// Contextualization document, forwarded verbatim.
    pub context: Option<Value>,
}

/// VM state as the driver reports it. The control plane never stores this
/// directly; it is folded into [`InstanceState`] via [`map_driver_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverNodeState {
    Running,
    Aborted,
    Inaccessible,
    Stuck,
    Listing,
    NotCreated,
    PoweredOff,
    Saved,
}

/// Fold a driver-view state into the instance state machine.
pub fn map_driver_state(state: DriverNodeState) -> InstanceState {
    match state {
        DriverNodeState::Running => InstanceState::Started,
        DriverNodeState::Aborted
        | DriverNodeState::Inaccessible
        | DriverNodeState::Stuck
        | DriverNodeState::Listing => InstanceState::ErrorRetrying,
        DriverNodeState::NotCreated | DriverNodeState::PoweredOff | DriverNodeState::Saved => {
            InstanceState::Terminated
        }
    }
}

/// One VM as the driver sees it right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IaasNode {
    /// Unique within the site.
    pub iaas_id: String,
    pub state: DriverNodeState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

/// Thin adapter over one IaaS endpoint.
#[async_trait]
pub trait IaasDriver: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn create_node(&self, spec: &NodeSpec) -> Result<IaasNode, IaasError>;

    async fn list_nodes(&self) -> Result<Vec<IaasNode>, IaasError>;

    async fn describe_node(&self, iaas_id: &str) -> Result<Option<IaasNode>, IaasError>;

    async fn destroy_node(&self, iaas_id: &str) -> Result<(), IaasError>;
}

/// Wraps a driver so every call carries a deadline. A timed-out call is a
/// retryable error; durable state is only advanced after confirmation.
pub struct DeadlineDriver {
    inner: Arc<dyn IaasDriver>,
    deadline: Duration,
}

impl DeadlineDriver {
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

    pub fn new(inner: Arc<dyn IaasDriver>, deadline: Duration) -> Self {
        DeadlineDriver { inner, deadline }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = Result<T, IaasError>> + Send,
    ) -> Result<T, IaasError> {
        tokio::time::timeout(self.deadline, fut)
            .await
            .map_err(|_| IaasError::Timeout { op, secs: self.deadline.as_secs() })?
    }
}

#[async_trait]
impl IaasDriver for DeadlineDriver {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn create_node(&self, spec: &NodeSpec) -> Result<IaasNode, IaasError> {
        self.bounded("create_node", self.inner.create_node(spec)).await
    }

    async fn list_nodes(&self) -> Result<Vec<IaasNode>, IaasError> {
        self.bounded("list_nodes", self.inner.list_nodes()).await
    }

    async fn describe_node(&self, iaas_id: &str) -> Result<Option<IaasNode>, IaasError> {
        self.bounded("describe_node", self.inner.describe_node(iaas_id)).await
    }

    async fn destroy_node(&self, iaas_id: &str) -> Result<(), IaasError> {
        self.bounded("destroy_node", self.inner.destroy_node(iaas_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_map_matches_driver_contract() {
        assert_eq!(map_driver_state(DriverNodeState::Running), InstanceState::Started);
        for s in [
            DriverNodeState::Aborted,
            DriverNodeState::Inaccessible,
            DriverNodeState::Stuck,
            DriverNodeState::Listing,
        ] {
            assert_eq!(map_driver_state(s), InstanceState::ErrorRetrying);
        }
        for s in [
            DriverNodeState::NotCreated,
            DriverNodeState::PoweredOff,
            DriverNodeState::Saved,
        ] {
            assert_eq!(map_driver_state(s), InstanceState::Terminated);
        }
    }
}
