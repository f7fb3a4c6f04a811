use std::sync::Arc;

use epuctl_domain::{
    DomainId, DomainRecord, EngineId, InstanceId, InstanceRecord, InstanceState, LaunchId,
    LaunchRecord, ProcessRecord, QueueEntry, ResourceId, ResourceRecord, Upid,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::paths;
use crate::store::{StateStore, Version, NEW_RECORD};

/// How often a read-modify-write loop retries a lost CAS before giving up.
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Typed record accessors over the raw [`StateStore`].
///
/// Components never hold references between records; they fetch, mutate and
/// CAS back through this layer.
#[derive(Clone)]
pub struct ControlStore {
    store: Arc<dyn StateStore>,
}

impl ControlStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        ControlStore { store }
    }

    pub fn raw(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    // ── Generic helpers ───────────────────────────────────────────────────────

    pub async fn read<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<(T, Version)>, StoreError> {
        match self.store.get(path).await? {
            Some((value, version)) => Ok(Some((serde_json::from_value(value)?, version))),
            None => Ok(None),
        }
    }

    pub async fn create<T: Serialize>(&self, path: &str, record: &T) -> Result<Version, StoreError> {
        let value = serde_json::to_value(record)?;
        self.store.put(path, value, NEW_RECORD).await
    }

    /// Upsert: read the current version, then CAS. Retries lost races with a
    /// fresh version up to [`MAX_CAS_ATTEMPTS`] times.
    pub async fn write<T: Serialize>(&self, path: &str, record: &T) -> Result<Version, StoreError> {
        let value = serde_json::to_value(record)?;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let expected = match self.store.get(path).await? {
                Some((_, version)) => version,
                None => NEW_RECORD,
            };
            match self.store.put(path, value.clone(), expected).await {
                Ok(version) => return Ok(version),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::RetriesExhausted { path: path.to_string(), attempts: MAX_CAS_ATTEMPTS })
    }

    /// Read-modify-write with a bounded CAS retry loop. Returns the record
    /// as written.
    pub async fn update<T, F>(&self, path: &str, mut mutate: F) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Serialize,
        F: FnMut(&mut T) + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut record, version): (T, Version) = self
                .read(path)
                .await?
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            mutate(&mut record);
            let value = serde_json::to_value(&record)?;
            match self.store.put(path, value, version).await {
                Ok(_) => return Ok(record),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::RetriesExhausted { path: path.to_string(), attempts: MAX_CAS_ATTEMPTS })
    }

    async fn list_records<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        let mut records = Vec::new();
        for (_, value, _) in self.store.list(prefix).await? {
            records.push(serde_json::from_value(value)?);
        }
        Ok(records)
    }

    // ── Launches ──────────────────────────────────────────────────────────────

    pub async fn get_launch(&self, id: &LaunchId) -> Result<Option<LaunchRecord>, StoreError> {
        Ok(self.read(&paths::launch(id)).await?.map(|(r, _)| r))
    }

    pub async fn put_launch(&self, record: &LaunchRecord) -> Result<Version, StoreError> {
        self.write(&paths::launch(&record.launch_id), record).await
    }

    pub async fn create_launch(&self, record: &LaunchRecord) -> Result<Version, StoreError> {
        self.create(&paths::launch(&record.launch_id), record).await
    }

    pub async fn launches(&self) -> Result<Vec<LaunchRecord>, StoreError> {
        self.list_records(paths::LAUNCHES).await
    }

    pub async fn launches_in_state(
        &self,
        state: InstanceState,
    ) -> Result<Vec<LaunchRecord>, StoreError> {
        Ok(self.launches().await?.into_iter().filter(|l| l.state == state).collect())
    }

    pub async fn launches_at_or_below(
        &self,
        max_state: InstanceState,
    ) -> Result<Vec<LaunchRecord>, StoreError> {
        Ok(self.launches().await?.into_iter().filter(|l| l.state <= max_state).collect())
    }

    pub async fn update_launch<F>(&self, id: &LaunchId, mutate: F) -> Result<LaunchRecord, StoreError>
    where
        F: FnMut(&mut LaunchRecord) + Send,
    {
        self.update(&paths::launch(id), mutate).await
    }

    // ── Nodes ─────────────────────────────────────────────────────────────────

    pub async fn get_node(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError> {
        Ok(self.read(&paths::node(id)).await?.map(|(r, _)| r))
    }

    pub async fn put_node(&self, record: &InstanceRecord) -> Result<Version, StoreError> {
        self.write(&paths::node(&record.instance_id), record).await
    }

    pub async fn put_nodes(&self, records: &[InstanceRecord]) -> Result<(), StoreError> {
        for record in records {
            self.put_node(record).await?;
        }
        Ok(())
    }

    pub async fn nodes(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        self.list_records(paths::NODES).await
    }

    pub async fn nodes_in_state(
        &self,
        state: InstanceState,
    ) -> Result<Vec<InstanceRecord>, StoreError> {
        Ok(self.nodes().await?.into_iter().filter(|n| n.state == state).collect())
    }

    pub async fn nodes_at_or_below(
        &self,
        max_state: InstanceState,
    ) -> Result<Vec<InstanceRecord>, StoreError> {
        Ok(self.nodes().await?.into_iter().filter(|n| n.state <= max_state).collect())
    }

    pub async fn update_node<F>(&self, id: &InstanceId, mutate: F) -> Result<InstanceRecord, StoreError>
    where
        F: FnMut(&mut InstanceRecord) + Send,
    {
        self.update(&paths::node(id), mutate).await
    }

    // ── Domains ───────────────────────────────────────────────────────────────

    pub async fn get_domain(
        &self,
        owner: &str,
        id: &DomainId,
    ) -> Result<Option<DomainRecord>, StoreError> {
        Ok(self.read(&paths::domain(owner, id)).await?.map(|(r, _)| r))
    }

    pub async fn create_domain(&self, record: &DomainRecord) -> Result<Version, StoreError> {
        self.create(&paths::domain(&record.owner, &record.domain_id), record).await
    }

    pub async fn put_domain(&self, record: &DomainRecord) -> Result<Version, StoreError> {
        self.write(&paths::domain(&record.owner, &record.domain_id), record).await
    }

    pub async fn delete_domain(&self, owner: &str, id: &DomainId) -> Result<(), StoreError> {
        self.store.delete(&paths::domain(owner, id), 0).await
    }

    pub async fn domains(&self, owner: &str) -> Result<Vec<DomainRecord>, StoreError> {
        self.list_records(&paths::domain_owner_prefix(owner)).await
    }

    pub async fn all_domains(&self) -> Result<Vec<DomainRecord>, StoreError> {
        self.list_records(paths::DOMAINS).await
    }

    pub async fn update_domain<F>(
        &self,
        owner: &str,
        id: &DomainId,
        mutate: F,
    ) -> Result<DomainRecord, StoreError>
    where
        F: FnMut(&mut DomainRecord) + Send,
    {
        self.update(&paths::domain(owner, id), mutate).await
    }

    // ── Resources ─────────────────────────────────────────────────────────────

    pub async fn get_resource(
        &self,
        id: &ResourceId,
    ) -> Result<Option<ResourceRecord>, StoreError> {
        Ok(self.read(&paths::resource(id)).await?.map(|(r, _)| r))
    }

    pub async fn put_resource(&self, record: &ResourceRecord) -> Result<Version, StoreError> {
        self.write(&paths::resource(&record.resource_id), record).await
    }

    pub async fn resources(&self) -> Result<Vec<ResourceRecord>, StoreError> {
        self.list_records(paths::RESOURCES).await
    }

    pub async fn update_resource<F>(
        &self,
        id: &ResourceId,
        mutate: F,
    ) -> Result<ResourceRecord, StoreError>
    where
        F: FnMut(&mut ResourceRecord) + Send,
    {
        self.update(&paths::resource(id), mutate).await
    }

    pub async fn delete_resource(&self, id: &ResourceId) -> Result<(), StoreError> {
        self.store.delete(&paths::resource(id), 0).await
    }

    // ── Processes ─────────────────────────────────────────────────────────────

    pub async fn get_process(&self, upid: &Upid) -> Result<Option<ProcessRecord>, StoreError> {
        Ok(self.read(&paths::process(upid)).await?.map(|(r, _)| r))
    }

    pub async fn create_process(&self, record: &ProcessRecord) -> Result<Version, StoreError> {
        self.create(&paths::process(&record.upid), record).await
    }

    pub async fn put_process(&self, record: &ProcessRecord) -> Result<Version, StoreError> {
        self.write(&paths::process(&record.upid), record).await
    }

    pub async fn processes(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        self.list_records(paths::PROCESSES).await
    }

    pub async fn update_process<F>(&self, upid: &Upid, mutate: F) -> Result<ProcessRecord, StoreError>
    where
        F: FnMut(&mut ProcessRecord) + Send,
    {
        self.update(&paths::process(upid), mutate).await
    }

    // ── Queues ────────────────────────────────────────────────────────────────

    pub async fn get_queue(
        &self,
        engine: &EngineId,
        priority: u8,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(self
            .read(&paths::queue(engine, priority))
            .await?
            .map(|(q, _)| q)
            .unwrap_or_default())
    }

    pub async fn put_queue(
        &self,
        engine: &EngineId,
        priority: u8,
        entries: &[QueueEntry],
    ) -> Result<Version, StoreError> {
        self.write(&paths::queue(engine, priority), &entries).await
    }

    /// All queues for an engine, highest priority first.
    pub async fn queues_for_engine(
        &self,
        engine: &EngineId,
    ) -> Result<Vec<(u8, Vec<QueueEntry>)>, StoreError> {
        let prefix = paths::queue_engine_prefix(engine);
        let mut queues = Vec::new();
        for (path, value, _) in self.store.list(&prefix).await? {
            let Some(priority) = path.rsplit('/').next().and_then(|p| p.parse::<u8>().ok())
            else {
                continue;
            };
            let entries: Vec<QueueEntry> = serde_json::from_value(value)?;
            queues.push((priority, entries));
        }
        queues.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(queues)
    }

    // ── Agent liveness ────────────────────────────────────────────────────────

    pub async fn agent_heartbeat(
        &self,
        id: &ResourceId,
        value: Value,
    ) -> Result<(), StoreError> {
        self.store.put_ephemeral(&paths::agent(id), value).await
    }

    pub async fn delete_agent(&self, id: &ResourceId) -> Result<(), StoreError> {
        self.store.delete(&paths::agent(id), 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::Utc;
    use epuctl_domain::Subscriber;
    use serde_json::Map;

    fn control_store() -> ControlStore {
        ControlStore::new(Arc::new(MemoryStore::new()))
    }

    fn launch(id: &str, state: InstanceState) -> LaunchRecord {
        LaunchRecord {
            launch_id: LaunchId::new(id),
            domain_id: None,
            deployable_type: "sleeper".to_string(),
            subscribers: vec![Subscriber::new("sub", "instance_info")],
            state,
            state_desc: None,
            node_ids: vec![],
            creator: None,
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn launch_round_trip_and_filters() {
        let store = control_store();
        store.put_launch(&launch("a", InstanceState::Requested)).await.unwrap();
        store.put_launch(&launch("b", InstanceState::Terminating)).await.unwrap();
        store.put_launch(&launch("c", InstanceState::Terminated)).await.unwrap();

        let got = store.get_launch(&LaunchId::new("a")).await.unwrap().unwrap();
        assert_eq!(got.deployable_type, "sleeper");

        assert_eq!(store.launches_in_state(InstanceState::Requested).await.unwrap().len(), 1);
        assert_eq!(store.launches_at_or_below(InstanceState::Terminating).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_retries_are_bounded_to_real_conflicts() {
        let store = control_store();
        store.put_launch(&launch("a", InstanceState::Requested)).await.unwrap();

        let updated = store
            .update_launch(&LaunchId::new("a"), |l| l.state = InstanceState::Pending)
            .await
            .unwrap();
        assert_eq!(updated.state, InstanceState::Pending);

        let err = store
            .update_launch(&LaunchId::new("missing"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn queues_sorted_by_priority_descending() {
        let store = control_store();
        let engine = EngineId::new("default");
        let entry = |upid: &str, priority: u8| QueueEntry {
            upid: Upid::new(upid),
            priority,
            enqueued_at: Utc::now(),
        };
        store.put_queue(&engine, 1, &[entry("p1", 1)]).await.unwrap();
        store.put_queue(&engine, 9, &[entry("p9", 9)]).await.unwrap();
        store.put_queue(&engine, 5, &[entry("p5", 5)]).await.unwrap();

        let queues = store.queues_for_engine(&engine).await.unwrap();
        let priorities: Vec<u8> = queues.iter().map(|(p, _)| *p).collect();
        assert_eq!(priorities, vec![9, 5, 1]);
    }

    #[tokio::test]
    async fn domains_are_scoped_by_owner() {
        let store = control_store();
        let record = |owner: &str, id: &str| DomainRecord {
            domain_id: DomainId::new(id),
            owner: owner.to_string(),
            engine_id: EngineId::new("default"),
            decision_engine: "simplest".to_string(),
            config: serde_json::json!({"preserve_n": 0}),
            state: Default::default(),
            monitor_health: false,
            subscribers: vec![],
            sensor_data: Default::default(),
            extra: Map::new(),
        };
        store.create_domain(&record("alice", "dom1")).await.unwrap();
        store.create_domain(&record("bob", "dom1")).await.unwrap();
        store.create_domain(&record("bob", "dom2")).await.unwrap();

        assert_eq!(store.domains("alice").await.unwrap().len(), 1);
        assert_eq!(store.domains("bob").await.unwrap().len(), 2);
        assert_eq!(store.all_domains().await.unwrap().len(), 3);

        // duplicate create is a conflict, not an overwrite
        assert!(store.create_domain(&record("alice", "dom1")).await.is_err());
    }
}
