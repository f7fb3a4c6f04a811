use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::StoreError;

/// Monotonically increasing per-path record version.
pub type Version = u64;

/// Version argument meaning "the path must not exist yet".
pub const NEW_RECORD: Version = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Put,
    Delete,
}

/// Change notification delivered to watchers.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub path: String,
    pub value: Option<Value>,
    pub version: Version,
}

/// Hierarchical key-value store with compare-and-set writes.
///
/// All durable control-plane state lives behind this trait. Components hold
/// short-lived snapshots only; every mutation is a read-modify-write gated
/// on the record version.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, path: &str) -> Result<Option<(Value, Version)>, StoreError>;

    /// Write `value` at `path`.
    ///
    /// `expected_version` of [`NEW_RECORD`] requires the path to be absent;
    /// any other value must match the current version. Returns the new
    /// version on success, `Conflict` when the guard fails, `NotFound` when
    /// a guarded put targets a missing path.
    async fn put(
        &self,
        path: &str,
        value: Value,
        expected_version: Version,
    ) -> Result<Version, StoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value, Version)>, StoreError>;

    /// Delete `path`. `expected_version` of 0 deletes unconditionally and is
    /// idempotent; a guarded delete behaves like a guarded put.
    async fn delete(&self, path: &str, expected_version: Version) -> Result<(), StoreError>;

    /// Unconditional write of a liveness record. On the coordination
    /// backend the node is lease-attached and disappears with its writer.
    async fn put_ephemeral(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Subscribe to changes under `prefix`.
    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>, StoreError>;
}
