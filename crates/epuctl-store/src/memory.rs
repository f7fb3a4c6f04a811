use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use crate::error::StoreError;
use crate::store::{StateStore, StoreEvent, StoreEventKind, Version, NEW_RECORD};

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, (Value, Version)>,
    next_version: Version,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn bump(&mut self) -> Version {
        self.next_version += 1;
        self.next_version
    }

    fn notify(&mut self, event: StoreEvent) {
        self.watchers.retain(|w| {
            if !event.path.starts_with(&w.prefix) {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
    }
}

/// In-memory implementation of [`StateStore`].
///
/// All data is lost on process exit. Suitable for tests and single-replica
/// deployments; versions are monotonic integers shared across paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<(Value, Version)>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.entries.get(path).cloned())
    }

    async fn put(
        &self,
        path: &str,
        value: Value,
        expected_version: Version,
    ) -> Result<Version, StoreError> {
        let mut guard = self.inner.write().await;
        match (guard.entries.get(path), expected_version) {
            (None, NEW_RECORD) => {}
            (None, _) => return Err(StoreError::NotFound(path.to_string())),
            (Some(_), NEW_RECORD) => {
                return Err(StoreError::Conflict { path: path.to_string(), expected: NEW_RECORD })
            }
            (Some((_, current)), expected) if *current != expected => {
                return Err(StoreError::Conflict { path: path.to_string(), expected })
            }
            (Some(_), _) => {}
        }

        let version = guard.bump();
        guard.entries.insert(path.to_string(), (value.clone(), version));
        guard.notify(StoreEvent {
            kind: StoreEventKind::Put,
            path: path.to_string(),
            value: Some(value),
            version,
        });
        Ok(version)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value, Version)>, StoreError> {
        let guard = self.inner.read().await;
        let mut items: Vec<(String, Value, Version)> = guard
            .entries
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, (value, version))| (path.clone(), value.clone(), *version))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items)
    }

    async fn delete(&self, path: &str, expected_version: Version) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        match (guard.entries.get(path), expected_version) {
            (None, 0) => return Ok(()),
            (None, _) => return Err(StoreError::NotFound(path.to_string())),
            (Some((_, current)), expected) if expected != 0 && *current != expected => {
                return Err(StoreError::Conflict { path: path.to_string(), expected })
            }
            _ => {}
        }
        guard.entries.remove(path);
        let version = guard.bump();
        guard.notify(StoreEvent {
            kind: StoreEventKind::Delete,
            path: path.to_string(),
            value: None,
            version,
        });
        Ok(())
    }

    async fn put_ephemeral(&self, path: &str, value: Value) -> Result<(), StoreError> {
        // No leases in a single process; an ephemeral record is a plain put.
        let mut guard = self.inner.write().await;
        let version = guard.bump();
        guard.entries.insert(path.to_string(), (value.clone(), version));
        guard.notify(StoreEvent {
            kind: StoreEventKind::Put,
            path: path.to_string(),
            value: Some(value),
            version,
        });
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.inner.write().await;
        guard.watchers.push(Watcher { prefix: prefix.to_string(), tx });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_get() {
        let store = MemoryStore::new();
        let version = store.put("/launches/a", json!({"x": 1}), NEW_RECORD).await.unwrap();
        assert!(version > 0);

        let (value, got_version) = store.get("/launches/a").await.unwrap().unwrap();
        assert_eq!(value["x"], 1);
        assert_eq!(got_version, version);
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let store = MemoryStore::new();
        store.put("/a", json!(1), NEW_RECORD).await.unwrap();
        let err = store.put("/a", json!(2), NEW_RECORD).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn cas_put_requires_current_version() {
        let store = MemoryStore::new();
        let v1 = store.put("/a", json!(1), NEW_RECORD).await.unwrap();
        let v2 = store.put("/a", json!(2), v1).await.unwrap();
        assert!(v2 > v1);

        // stale writer loses
        let err = store.put("/a", json!(3), v1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        let (value, _) = store.get("/a").await.unwrap().unwrap();
        assert_eq!(value, json!(2));
    }

    #[tokio::test]
    async fn guarded_put_on_missing_path_is_not_found() {
        let store = MemoryStore::new();
        let err = store.put("/missing", json!(1), 7).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let store = MemoryStore::new();
        store.put("/nodes/b", json!(2), NEW_RECORD).await.unwrap();
        store.put("/nodes/a", json!(1), NEW_RECORD).await.unwrap();
        store.put("/launches/x", json!(3), NEW_RECORD).await.unwrap();

        let nodes = store.list("/nodes").await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].0, "/nodes/a");
        assert_eq!(nodes[1].0, "/nodes/b");
    }

    #[tokio::test]
    async fn unconditional_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.put("/a", json!(1), NEW_RECORD).await.unwrap();
        store.delete("/a", 0).await.unwrap();
        store.delete("/a", 0).await.unwrap();
        assert!(store.get("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_sees_puts_and_deletes_under_prefix() {
        let store = MemoryStore::new();
        let mut rx = store.watch("/nodes").await.unwrap();

        store.put("/nodes/n1", json!({"s": 1}), NEW_RECORD).await.unwrap();
        store.put("/launches/l1", json!({}), NEW_RECORD).await.unwrap();
        store.delete("/nodes/n1", 0).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.path, "/nodes/n1");
        assert_eq!(first.kind, StoreEventKind::Put);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, StoreEventKind::Delete);
        assert_eq!(second.path, "/nodes/n1");
    }
}
