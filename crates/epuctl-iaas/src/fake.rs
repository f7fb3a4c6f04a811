use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::driver::{DriverNodeState, IaasDriver, IaasNode, NodeSpec};
use crate::error::IaasError;

#[derive(Default)]
struct FakeInner {
    nodes: HashMap<String, IaasNode>,
    next_id: u64,
    fail_next_create: Option<String>,
}

/// In-memory stand-in for a real IaaS endpoint.
///
/// Creates deterministic node ids, reports every VM `RUNNING` until told
/// otherwise, and offers failure-injection knobs for tests.
#[derive(Clone, Default)]
pub struct FakeIaasDriver {
    inner: Arc<Mutex<FakeInner>>,
}

impl FakeIaasDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create_node` call fail with the given message.
    pub fn fail_next_create(&self, message: impl Into<String>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.fail_next_create = Some(message.into());
    }

    /// Override the driver-view state of an existing VM.
    pub fn set_node_state(&self, iaas_id: &str, state: DriverNodeState) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(node) = guard.nodes.get_mut(iaas_id) {
            node.state = state;
        }
    }

    pub fn node_count(&self) -> usize {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.nodes.len()
    }
}

#[async_trait]
impl IaasDriver for FakeIaasDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create_node(&self, spec: &NodeSpec) -> Result<IaasNode, IaasError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(message) = guard.fail_next_create.take() {
            return Err(IaasError::CreateFailed(message));
        }

        guard.next_id += 1;
        let id = guard.next_id;
        let node = IaasNode {
            iaas_id: format!("fake-{}", id),
            state: DriverNodeState::Running,
            public_ip: Some(format!("198.51.100.{}", id % 254 + 1)),
            private_ip: Some(format!("10.0.0.{}", id % 254 + 1)),
        };
        debug!(node_id = %spec.node_id, iaas_id = %node.iaas_id, "fake create_node");
        guard.nodes.insert(node.iaas_id.clone(), node.clone());
        Ok(node)
    }

    async fn list_nodes(&self) -> Result<Vec<IaasNode>, IaasError> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut nodes: Vec<IaasNode> = guard.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.iaas_id.cmp(&b.iaas_id));
        Ok(nodes)
    }

    async fn describe_node(&self, iaas_id: &str) -> Result<Option<IaasNode>, IaasError> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.nodes.get(iaas_id).cloned())
    }

    async fn destroy_node(&self, iaas_id: &str) -> Result<(), IaasError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.nodes.remove(iaas_id).is_none() {
            return Err(IaasError::NotFound(iaas_id.to_string()));
        }
        debug!(iaas_id, "fake destroy_node");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epuctl_domain::InstanceId;

    fn spec(id: &str) -> NodeSpec {
        NodeSpec {
            node_id: InstanceId::new(id),
            image: Some("ami-fake".to_string()),
            allocation: None,
            context: None,
        }
    }

    #[tokio::test]
    async fn create_list_destroy() {
        let driver = FakeIaasDriver::new();
        let node = driver.create_node(&spec("n1")).await.unwrap();
        assert_eq!(node.state, DriverNodeState::Running);
        assert_eq!(driver.list_nodes().await.unwrap().len(), 1);

        driver.destroy_node(&node.iaas_id).await.unwrap();
        assert!(driver.list_nodes().await.unwrap().is_empty());
        assert!(matches!(
            driver.destroy_node(&node.iaas_id).await,
            Err(IaasError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ids_are_unique_within_the_site() {
        let driver = FakeIaasDriver::new();
        let a = driver.create_node(&spec("n1")).await.unwrap();
        let b = driver.create_node(&spec("n2")).await.unwrap();
        assert_ne!(a.iaas_id, b.iaas_id);
    }

    #[tokio::test]
    async fn injected_failure_hits_once() {
        let driver = FakeIaasDriver::new();
        driver.fail_next_create("boom");
        assert!(driver.create_node(&spec("n1")).await.is_err());
        assert!(driver.create_node(&spec("n2")).await.is_ok());
    }

    #[tokio::test]
    async fn forced_state_shows_up_in_listing() {
        let driver = FakeIaasDriver::new();
        let node = driver.create_node(&spec("n1")).await.unwrap();
        driver.set_node_state(&node.iaas_id, DriverNodeState::PoweredOff);

        let listed = driver.describe_node(&node.iaas_id).await.unwrap().unwrap();
        assert_eq!(listed.state, DriverNodeState::PoweredOff);
    }
}
