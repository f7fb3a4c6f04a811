//! Coordination-service backend over etcd.
//!
//! Used for multi-replica deployments: CAS writes become version-compare
//! transactions, ephemeral liveness records ride on a session lease, and
//! leader election uses the etcd election RPCs with a lease TTL equal to
//! the configured leader grace.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, ResignOptions, Txn, TxnOp,
    TxnOpResponse, WatchOptions,
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::election::{Elector, LeaderStatus, LeadershipHandle, Role};
use crate::error::StoreError;
use crate::store::{StateStore, StoreEvent, StoreEventKind, Version, NEW_RECORD};

fn backend_err(e: etcd_client::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Replicated [`StateStore`] backend.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    /// Namespace prefix, normally the configured `coordination_path`.
    root: String,
    /// Session lease backing ephemeral records.
    session_lease: i64,
}

impl EtcdStore {
    /// Connect and start the session-lease keepalive.
    pub async fn connect(
        hosts: &[String],
        root: &str,
        session_ttl: Duration,
    ) -> Result<Self, StoreError> {
        let mut client = Client::connect(hosts, None).await.map_err(backend_err)?;
        let ttl = session_ttl.as_secs().max(2) as i64;
        let lease = client.lease_grant(ttl, None).await.map_err(backend_err)?;
        let session_lease = lease.id();

        let (mut keeper, mut responses) =
            client.lease_keep_alive(session_lease).await.map_err(backend_err)?;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs((ttl as u64 / 3).max(1)));
            loop {
                interval.tick().await;
                if keeper.keep_alive().await.is_err() {
                    warn!("session lease keepalive failed; ephemeral records will expire");
                    return;
                }
                if let Ok(None) = responses.message().await {
                    return;
                }
            }
        });

        Ok(EtcdStore {
            client,
            root: root.trim_end_matches('/').to_string(),
            session_lease,
        })
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.root, path)
    }

    fn strip(&self, key: &str) -> String {
        key.strip_prefix(self.root.as_str()).unwrap_or(key).to_string()
    }
}

#[async_trait]
impl StateStore for EtcdStore {
    async fn get(&self, path: &str) -> Result<Option<(Value, Version)>, StoreError> {
        let mut client = self.client.clone();
        let response = client.get(self.key(path), None).await.map_err(backend_err)?;
        let Some(kv) = response.kvs().first() else { return Ok(None) };
        let value: Value = serde_json::from_slice(kv.value())?;
        Ok(Some((value, kv.version() as Version)))
    }

    async fn put(
        &self,
        path: &str,
        value: Value,
        expected_version: Version,
    ) -> Result<Version, StoreError> {
        let key = self.key(path);
        let bytes = serde_json::to_vec(&value)?;

        // Guard on the per-key version, then read the new version back in
        // the same transaction.
        let txn = Txn::new()
            .when(vec![Compare::version(
                key.clone(),
                CompareOp::Equal,
                expected_version as i64,
            )])
            .and_then(vec![
                TxnOp::put(key.clone(), bytes, None),
                TxnOp::get(key.clone(), None),
            ]);

        let mut client = self.client.clone();
        let response = client.txn(txn).await.map_err(backend_err)?;
        if !response.succeeded() {
            // Distinguish a missing path from a lost race.
            if expected_version != NEW_RECORD {
                let current = client.get(key.clone(), None).await.map_err(backend_err)?;
                if current.kvs().is_empty() {
                    return Err(StoreError::NotFound(path.to_string()));
                }
            }
            return Err(StoreError::Conflict { path: path.to_string(), expected: expected_version });
        }

        for op in response.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                if let Some(kv) = get.kvs().first() {
                    return Ok(kv.version() as Version);
                }
            }
        }
        Err(StoreError::Backend("txn put did not return the new version".to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value, Version)>, StoreError> {
        let mut client = self.client.clone();
        let response = client
            .get(self.key(prefix), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend_err)?;

        let mut items = Vec::new();
        for kv in response.kvs() {
            let key = kv.key_str().map_err(backend_err)?;
            let value: Value = serde_json::from_slice(kv.value())?;
            items.push((self.strip(key), value, kv.version() as Version));
        }
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items)
    }

    async fn delete(&self, path: &str, expected_version: Version) -> Result<(), StoreError> {
        let key = self.key(path);
        let mut client = self.client.clone();

        if expected_version == 0 {
            client.delete(key, None).await.map_err(backend_err)?;
            return Ok(());
        }

        let txn = Txn::new()
            .when(vec![Compare::version(key.clone(), CompareOp::Equal, expected_version as i64)])
            .and_then(vec![TxnOp::delete(key.clone(), None)]);
        let response = client.txn(txn).await.map_err(backend_err)?;
        if !response.succeeded() {
            let current = client.get(key, None).await.map_err(backend_err)?;
            if current.kvs().is_empty() {
                return Err(StoreError::NotFound(path.to_string()));
            }
            return Err(StoreError::Conflict { path: path.to_string(), expected: expected_version });
        }
        Ok(())
    }

    async fn put_ephemeral(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&value)?;
        let mut client = self.client.clone();
        client
            .put(
                self.key(path),
                bytes,
                Some(PutOptions::new().with_lease(self.session_lease)),
            )
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>, StoreError> {
        let mut client = self.client.clone();
        let (_watcher, mut stream) = client
            .watch(self.key(prefix), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(backend_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let root = self.root.clone();
        tokio::spawn(async move {
            while let Ok(Some(response)) = stream.message().await {
                for event in response.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };
                    let path = key.strip_prefix(root.as_str()).unwrap_or(key).to_string();
                    let store_event = match event.event_type() {
                        EventType::Put => StoreEvent {
                            kind: StoreEventKind::Put,
                            path,
                            value: serde_json::from_slice(kv.value()).ok(),
                            version: kv.version() as Version,
                        },
                        EventType::Delete => StoreEvent {
                            kind: StoreEventKind::Delete,
                            path,
                            value: None,
                            version: kv.version() as Version,
                        },
                    };
                    if tx.send(store_event).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Leader election over the etcd election RPCs.
#[derive(Clone)]
pub struct EtcdElector {
    client: Client,
    root: String,
    /// Election lease TTL; a crashed leader is deposed after this long.
    grace: Duration,
    replica_id: String,
}

impl EtcdElector {
    pub fn new(client: Client, root: &str, grace: Duration, replica_id: String) -> Self {
        EtcdElector {
            client,
            root: root.trim_end_matches('/').to_string(),
            grace,
            replica_id,
        }
    }

    pub async fn connect(
        hosts: &[String],
        root: &str,
        grace: Duration,
        replica_id: String,
    ) -> Result<Self, StoreError> {
        let client = Client::connect(hosts, None).await.map_err(backend_err)?;
        Ok(EtcdElector::new(client, root, grace, replica_id))
    }
}

#[async_trait]
impl Elector for EtcdElector {
    async fn join(&self, role: Role) -> Result<LeadershipHandle, StoreError> {
        let election = format!("{}/leaders/{}", self.root, role.as_str());
        let mut client = self.client.clone();
        let ttl = self.grace.as_secs().max(2) as i64;
        let lease = client.lease_grant(ttl, None).await.map_err(backend_err)?;
        let lease_id = lease.id();

        let (status_tx, status_rx) = watch::channel(LeaderStatus::Standby);
        let (resign_tx, mut resign_rx) = mpsc::unbounded_channel::<()>();
        let replica_id = self.replica_id.clone();

        tokio::spawn(async move {
            let (mut keeper, mut keepalive) = match client.lease_keep_alive(lease_id).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(role = role.as_str(), error = %e, "election keepalive failed");
                    return;
                }
            };
            let mut renew = tokio::time::interval(Duration::from_secs((ttl as u64 / 3).max(1)));
            let mut revoke_client = client.clone();

            // Campaign blocks until this candidate holds the election key.
            let campaign = tokio::select! {
                result = client.campaign(election.clone(), replica_id.clone(), lease_id) => result,
                _ = resign_rx.recv() => {
                    let _ = revoke_client.lease_revoke(lease_id).await;
                    return;
                }
            };
            let leader_key = match campaign {
                Ok(mut response) => response.take_leader(),
                Err(e) => {
                    warn!(role = role.as_str(), error = %e, "election campaign failed");
                    return;
                }
            };
            debug!(role = role.as_str(), "acquired leadership");
            let _ = status_tx.send(LeaderStatus::Leader);

            loop {
                tokio::select! {
                    _ = resign_rx.recv() => {
                        if let Some(leader) = leader_key {
                            let _ = client
                                .resign(Some(ResignOptions::new().with_leader(leader)))
                                .await;
                        }
                        let _ = client.lease_revoke(lease_id).await;
                        let _ = status_tx.send(LeaderStatus::Standby);
                        return;
                    }
                    _ = renew.tick() => {
                        if keeper.keep_alive().await.is_err() {
                            warn!(role = role.as_str(), "lost election lease");
                            let _ = status_tx.send(LeaderStatus::Standby);
                            return;
                        }
                        if let Ok(None) = keepalive.message().await {
                            let _ = status_tx.send(LeaderStatus::Standby);
                            return;
                        }
                    }
                }
            }
        });

        Ok(LeadershipHandle::from_parts(
            role,
            status_rx,
            Box::new(move || {
                let _ = resign_tx.send(());
            }),
        ))
    }
}

// Gated: needs a reachable etcd. Set EPUCTL_TEST_ETCD to a host:port to run.
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store() -> Option<EtcdStore> {
        let Ok(host) = std::env::var("EPUCTL_TEST_ETCD") else { return None };
        EtcdStore::connect(&[host], "/epuctl-test", Duration::from_secs(5)).await.ok()
    }

    #[tokio::test]
    async fn cas_round_trip_against_live_etcd() {
        let Some(store) = test_store().await else { return };

        let path = format!("/nodes/{}", uuid_like());
        let v1 = store.put(&path, json!({"x": 1}), NEW_RECORD).await.unwrap();
        let (value, version) = store.get(&path).await.unwrap().unwrap();
        assert_eq!(value["x"], 1);
        assert_eq!(version, v1);

        assert!(matches!(
            store.put(&path, json!({"x": 2}), NEW_RECORD).await,
            Err(StoreError::Conflict { .. })
        ));

        store.put(&path, json!({"x": 2}), v1).await.unwrap();
        store.delete(&path, 0).await.unwrap();
    }

    fn uuid_like() -> String {
        format!("{:x}", std::time::UNIX_EPOCH.elapsed().unwrap_or_default().as_nanos())
    }
}
