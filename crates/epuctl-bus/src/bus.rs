use async_trait::async_trait;
use serde_json::Value;

use crate::error::BusError;

/// A service endpoint: dispatches one named operation per call.
#[async_trait]
pub trait BusHandler: Send + Sync + 'static {
    async fn handle(&self, operation: &str, payload: Value) -> Result<Value, BusError>;
}

/// Topic-addressed RPC plus one-way fan-out.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// RPC: call `operation` on the service registered under `name` and
    /// wait for its reply. Carries a deadline.
    async fn call(&self, name: &str, operation: &str, payload: Value) -> Result<Value, BusError>;

    /// One-way send. Delivery failures after the transport accepts the
    /// message are not reported to the caller.
    async fn fire(&self, name: &str, operation: &str, payload: Value) -> Result<(), BusError>;
}
