use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::bus::{BusHandler, MessageBus};
use crate::error::BusError;

struct Endpoint {
    handler: Arc<dyn BusHandler>,
    /// One-way messages drain through this queue; a single consumer task
    /// per endpoint keeps them in submission order.
    oneway_tx: mpsc::UnboundedSender<(String, Value)>,
}

/// Single-process [`MessageBus`]: a registry of handlers keyed by bus name.
#[derive(Clone)]
pub struct InProcessBus {
    endpoints: Arc<RwLock<HashMap<String, Endpoint>>>,
    deadline: Duration,
}

impl InProcessBus {
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self::with_deadline(Self::DEFAULT_DEADLINE)
    }

    pub fn with_deadline(deadline: Duration) -> Self {
        InProcessBus { endpoints: Arc::new(RwLock::new(HashMap::new())), deadline }
    }

    pub async fn register(&self, name: impl Into<String>, handler: Arc<dyn BusHandler>) {
        let name = name.into();
        let (oneway_tx, mut oneway_rx) = mpsc::unbounded_channel::<(String, Value)>();

        let consumer_handler = handler.clone();
        let consumer_name = name.clone();
        let deadline = self.deadline;
        tokio::spawn(async move {
            while let Some((operation, payload)) = oneway_rx.recv().await {
                match tokio::time::timeout(
                    deadline,
                    consumer_handler.handle(&operation, payload),
                )
                .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(
                        name = %consumer_name, %operation, error = %e,
                        "one-way delivery failed"
                    ),
                    Err(_) => warn!(
                        name = %consumer_name, %operation,
                        "one-way delivery timed out"
                    ),
                }
            }
        });

        let mut guard = self.endpoints.write().await;
        guard.insert(name, Endpoint { handler, oneway_tx });
    }

    pub async fn deregister(&self, name: &str) {
        let mut guard = self.endpoints.write().await;
        guard.remove(name);
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn call(&self, name: &str, operation: &str, payload: Value) -> Result<Value, BusError> {
        let handler = {
            let guard = self.endpoints.read().await;
            guard
                .get(name)
                .map(|e| e.handler.clone())
                .ok_or_else(|| BusError::UnknownTarget(name.to_string()))?
        };
        tokio::time::timeout(self.deadline, handler.handle(operation, payload))
            .await
            .map_err(|_| BusError::Timeout {
                name: name.to_string(),
                operation: operation.to_string(),
                secs: self.deadline.as_secs(),
            })?
    }

    async fn fire(&self, name: &str, operation: &str, payload: Value) -> Result<(), BusError> {
        let guard = self.endpoints.read().await;
        let endpoint = guard
            .get(name)
            .ok_or_else(|| BusError::UnknownTarget(name.to_string()))?;
        endpoint
            .oneway_tx
            .send((operation.to_string(), payload))
            .map_err(|_| BusError::UnknownTarget(name.to_string()))
    }
}
