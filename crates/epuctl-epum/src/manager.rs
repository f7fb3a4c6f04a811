use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use epuctl_bus::{AgentHeartbeat, Notifier, ProvisionRequest, ProvisionerClient};
use epuctl_domain::{
    engine_id_from_domain, DomainId, DomainRecord, DomainState, EngineId, EngineRegistry,
    InstanceHealth, InstanceId, InstanceRecord, InstanceState, LaunchId, SiteId, Subscriber,
};
use epuctl_store::ControlStore;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::engine::{Action, DecisionEngine, DecisionEngineRegistry, DomainView};
use crate::error::EpumError;

const EVENT_SOURCE: &str = "epum";

/// EPU management: owns the domain catalog and runs each domain's decision
/// engine against observed state on every tick.
pub struct EpuManagement {
    store: ControlStore,
    provisioner: ProvisionerClient,
    notifier: Arc<dyn Notifier>,
    engines: DecisionEngineRegistry,
    engine_specs: EngineRegistry,
    /// Per-domain engine instances. In-memory policy state only; rebuilt
    /// from stored config on leader change.
    engine_cache: Mutex<HashMap<(String, DomainId), Box<dyn DecisionEngine>>>,
    default_user: String,
    heartbeat_timeout: Duration,
    /// Bus name this service answers on; stamped onto launch subscriptions.
    service_name: String,
}

impl EpuManagement {
    pub fn new(
        store: ControlStore,
        provisioner: ProvisionerClient,
        notifier: Arc<dyn Notifier>,
        engines: DecisionEngineRegistry,
        engine_specs: EngineRegistry,
        default_user: impl Into<String>,
        heartbeat_timeout: Duration,
        service_name: impl Into<String>,
    ) -> Self {
        EpuManagement {
            store,
            provisioner,
            notifier,
            engines,
            engine_specs,
            engine_cache: Mutex::new(HashMap::new()),
            default_user: default_user.into(),
            heartbeat_timeout,
            service_name: service_name.into(),
        }
    }

    fn owner_or_default<'a>(&'a self, owner: Option<&'a str>) -> &'a str {
        owner.unwrap_or(&self.default_user)
    }

    fn resolve_engine_id(&self, domain_id: &DomainId) -> EngineId {
        engine_id_from_domain(domain_id).unwrap_or_else(|_| {
            self.engine_specs
                .default_engine()
                .cloned()
                .unwrap_or_else(|| EngineId::new("default"))
        })
    }

    // ── Domain lifecycle ──────────────────────────────────────────────────────

    pub async fn add_domain(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
        config: Value,
    ) -> Result<(), EpumError> {
        let owner = self.owner_or_default(owner).to_string();

        let engine_class = config
            .pointer("/general/engine_class")
            .and_then(Value::as_str)
            .unwrap_or(crate::simplest::ENGINE_NAME)
            .to_string();
        // validate both the engine name and its configuration up front
        let engine_conf = config.get("engine_conf").cloned().unwrap_or_else(|| json!({}));
        self.engines.build(&engine_class, &engine_conf)?;

        let monitor_health = config
            .pointer("/health/monitor_health")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let record = DomainRecord {
            domain_id: domain_id.clone(),
            owner: owner.clone(),
            engine_id: self.resolve_engine_id(domain_id),
            decision_engine: engine_class,
            config,
            state: DomainState::New,
            monitor_health,
            subscribers: vec![],
            sensor_data: HashMap::new(),
            extra: Map::new(),
        };
        self.store.create_domain(&record).await.map_err(|e| match e {
            epuctl_store::StoreError::Conflict { .. } => {
                EpumError::DomainExists(domain_id.to_string())
            }
            other => EpumError::Store(other),
        })?;

        info!(%owner, %domain_id, "domain added");
        let mut extra = Map::new();
        extra.insert("domain_id".to_string(), Value::from(domain_id.as_str()));
        extra.insert("owner".to_string(), Value::from(owner));
        if let Err(e) = epuctl_events::emit(EVENT_SOURCE, "new_domain", extra) {
            warn!(error = %e, "event emission failed");
        }
        Ok(())
    }

    /// Mark the domain removed and terminate its instances. The record is
    /// deleted by a later tick, once every instance is terminal.
    pub async fn remove_domain(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
    ) -> Result<(), EpumError> {
        let owner = self.owner_or_default(owner).to_string();
        if self.store.get_domain(&owner, domain_id).await?.is_none() {
            return Err(EpumError::DomainNotFound(domain_id.to_string()));
        }
        self.store
            .update_domain(&owner, domain_id, |d| d.state = DomainState::Removed)
            .await?;

        let doomed = self.live_instance_ids(domain_id).await?;
        if !doomed.is_empty() {
            self.provisioner.terminate_nodes(&doomed).await?;
        }

        let mut cache = self.engine_cache.lock().await;
        cache.remove(&(owner, domain_id.clone()));
        info!(%domain_id, "domain removal started");
        Ok(())
    }

    /// Merge a config patch; the next tick sees the new target.
    pub async fn reconfigure_domain(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
        patch: Value,
    ) -> Result<(), EpumError> {
        let owner = self.owner_or_default(owner).to_string();
        if self.store.get_domain(&owner, domain_id).await?.is_none() {
            return Err(EpumError::DomainNotFound(domain_id.to_string()));
        }

        let applied = patch.clone();
        self.store
            .update_domain(&owner, domain_id, move |d| {
                merge_config(&mut d.config, &applied);
                if let Some(monitor) =
                    applied.pointer("/health/monitor_health").and_then(Value::as_bool)
                {
                    d.monitor_health = monitor;
                }
            })
            .await?;

        // keep the cached engine in step without waiting for a rebuild
        if let Some(engine_patch) = patch.get("engine_conf") {
            let mut cache = self.engine_cache.lock().await;
            if let Some(engine) = cache.get_mut(&(owner, domain_id.clone())) {
                engine.reconfigure(engine_patch)?;
            }
        }
        debug!(%domain_id, "domain reconfigured");
        Ok(())
    }

    pub async fn list_domains(&self, owner: Option<&str>) -> Result<Vec<DomainId>, EpumError> {
        let owner = self.owner_or_default(owner);
        let mut ids: Vec<DomainId> = self
            .store
            .domains(owner)
            .await?
            .into_iter()
            .map(|d| d.domain_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// The domain record plus its current instances.
    pub async fn describe_domain(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
    ) -> Result<Value, EpumError> {
        let owner = self.owner_or_default(owner);
        let domain = self
            .store
            .get_domain(owner, domain_id)
            .await?
            .ok_or_else(|| EpumError::DomainNotFound(domain_id.to_string()))?;
        let instances = self.instances_for_domain(domain_id).await?;

        let mut doc = serde_json::to_value(&domain).map_err(epuctl_store::StoreError::from)?;
        doc["instances"] =
            serde_json::to_value(&instances).map_err(epuctl_store::StoreError::from)?;
        Ok(doc)
    }

    pub async fn subscribe(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
        subscriber: Subscriber,
    ) -> Result<(), EpumError> {
        let owner = self.owner_or_default(owner).to_string();
        if self.store.get_domain(&owner, domain_id).await?.is_none() {
            return Err(EpumError::DomainNotFound(domain_id.to_string()));
        }
        self.store
            .update_domain(&owner, domain_id, move |d| {
                if !d.subscribers.contains(&subscriber) {
                    d.subscribers.push(subscriber.clone());
                }
            })
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        owner: Option<&str>,
        domain_id: &DomainId,
        subscriber_name: &str,
    ) -> Result<(), EpumError> {
        let owner = self.owner_or_default(owner).to_string();
        if self.store.get_domain(&owner, domain_id).await?.is_none() {
            return Err(EpumError::DomainNotFound(domain_id.to_string()));
        }
        let name = subscriber_name.to_string();
        self.store
            .update_domain(&owner, domain_id, move |d| {
                d.subscribers.retain(|s| s.name != name);
            })
            .await?;
        Ok(())
    }

    // ── Inbound signals ───────────────────────────────────────────────────────

    /// EEAgent liveness: refresh the node's health stamp.
    pub async fn heartbeat(&self, heartbeat: &AgentHeartbeat) -> Result<(), EpumError> {
        let node_id = heartbeat.node_id.clone();
        match self
            .store
            .update_node(&node_id, |n| {
                n.health = InstanceHealth::Ok;
                n.last_heartbeat = Some(Utc::now());
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(epuctl_store::StoreError::NotFound(_)) => {
                debug!(%node_id, "heartbeat for unknown node");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Provisioner state-change intake: fan out to the domain's subscribers.
    pub async fn instance_info(&self, record: Value) -> Result<(), EpumError> {
        let Ok(instance) = serde_json::from_value::<InstanceRecord>(record.clone()) else {
            warn!("dropping malformed instance record");
            return Ok(());
        };
        let Some(domain_id) = instance.domain_id.clone() else { return Ok(()) };

        let domains = self.store.all_domains().await?;
        let Some(domain) = domains.into_iter().find(|d| d.domain_id == domain_id) else {
            return Ok(());
        };
        if !domain.subscribers.is_empty() {
            self.notifier.send_record(record, &domain.subscribers).await;
        }
        Ok(())
    }

    /// Sensor sample intake, stored on the domain for engines to read.
    pub async fn sensor_info(&self, payload: Value) -> Result<(), EpumError> {
        let owner = payload
            .get("owner")
            .and_then(Value::as_str)
            .unwrap_or(&self.default_user)
            .to_string();
        let Some(domain_id) = payload.get("domain_id").and_then(Value::as_str) else {
            warn!("sensor_info without domain_id");
            return Ok(());
        };
        let Some(sensor_id) = payload.get("sensor_id").and_then(Value::as_str) else {
            warn!("sensor_info without sensor_id");
            return Ok(());
        };
        let domain_id = DomainId::new(domain_id);
        let sensor_id = sensor_id.to_string();
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        match self
            .store
            .update_domain(&owner, &domain_id, move |d| {
                d.sensor_data.insert(sensor_id.clone(), value.clone());
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(epuctl_store::StoreError::NotFound(_)) => {
                debug!(%domain_id, "sensor_info for unknown domain");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Tick ──────────────────────────────────────────────────────────────────

    /// One decision pass over every domain. Per-domain errors are logged
    /// and never abort the tick.
    pub async fn tick(&self) {
        let domains = match self.store.all_domains().await {
            Ok(domains) => domains,
            Err(e) => {
                error!(error = %e, "failed to list domains");
                return;
            }
        };
        for domain in domains {
            let domain_id = domain.domain_id.clone();
            if let Err(e) = self.tick_domain(domain).await {
                error!(%domain_id, error = %e, "domain tick failed");
            }
        }
    }

    async fn tick_domain(&self, mut domain: DomainRecord) -> Result<(), EpumError> {
        let instances = self.instances_for_domain(&domain.domain_id).await?;

        match domain.state {
            DomainState::Removed => {
                return self.finish_removal(&domain, &instances).await;
            }
            DomainState::New => {
                domain = self
                    .store
                    .update_domain(&domain.owner, &domain.domain_id, |d| {
                        d.state = DomainState::Running;
                    })
                    .await?;
            }
            DomainState::Running => {}
        }

        let instances = if domain.monitor_health {
            self.monitor_health(&domain, instances).await?
        } else {
            instances
        };

        let key = (domain.owner.clone(), domain.domain_id.clone());
        let mut cache = self.engine_cache.lock().await;
        let engine = match cache.entry(key) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let engine_conf =
                    domain.config.get("engine_conf").cloned().unwrap_or_else(|| json!({}));
                entry.insert(self.engines.build(&domain.decision_engine, &engine_conf)?)
            }
        };

        let view = DomainView { domain, instances };
        let actions = engine.decide(&view);
        drop(cache);

        for action in actions {
            match action {
                Action::Launch { count } => self.launch_instances(&view.domain, count).await,
                Action::Terminate { instance_ids } => {
                    if let Err(e) = self.provisioner.terminate_nodes(&instance_ids).await {
                        warn!(error = %e, "terminate request failed; next tick retries");
                    }
                }
            }
        }
        Ok(())
    }

    async fn finish_removal(
        &self,
        domain: &DomainRecord,
        instances: &[InstanceRecord],
    ) -> Result<(), EpumError> {
        let live: Vec<InstanceId> = instances
            .iter()
            .filter(|i| !i.state.is_terminal())
            .map(|i| i.instance_id.clone())
            .collect();
        if !live.is_empty() {
            // keep pushing; terminate_nodes is idempotent
            if let Err(e) = self.provisioner.terminate_nodes(&live).await {
                warn!(error = %e, "removal terminate failed; next tick retries");
            }
            return Ok(());
        }
        self.store.delete_domain(&domain.owner, &domain.domain_id).await?;
        info!(domain_id = %domain.domain_id, "domain removed");
        Ok(())
    }

    /// Flag instances whose heartbeat went stale and terminate the ones
    /// missing beyond the grace window. Returns the refreshed view.
    async fn monitor_health(
        &self,
        domain: &DomainRecord,
        instances: Vec<InstanceRecord>,
    ) -> Result<Vec<InstanceRecord>, EpumError> {
        let now = Utc::now();
        let timeout = self.heartbeat_timeout.as_secs() as i64;
        let mut refreshed = Vec::with_capacity(instances.len());

        for mut instance in instances {
            if instance.state != InstanceState::Running {
                refreshed.push(instance);
                continue;
            }
            let baseline = instance.last_heartbeat.or(instance.running_timestamp);
            let stale_secs = match baseline {
                Some(t) => now.signed_duration_since(t).num_seconds(),
                None => 0,
            };

            if stale_secs > 2 * timeout {
                warn!(
                    instance_id = %instance.instance_id,
                    domain_id = %domain.domain_id,
                    "instance missing beyond grace, terminating"
                );
                if let Err(e) = self
                    .provisioner
                    .terminate_nodes(std::slice::from_ref(&instance.instance_id))
                    .await
                {
                    warn!(error = %e, "health terminate failed");
                }
            } else if stale_secs > timeout && instance.health != InstanceHealth::Missing {
                info!(
                    instance_id = %instance.instance_id,
                    "missed heartbeats, marking missing"
                );
                instance = self
                    .store
                    .update_node(&instance.instance_id, |n| n.health = InstanceHealth::Missing)
                    .await?;
            }
            refreshed.push(instance);
        }
        Ok(refreshed)
    }

    async fn launch_instances(&self, domain: &DomainRecord, count: u32) {
        let engine_conf = domain.config.get("engine_conf").cloned().unwrap_or(Value::Null);
        let spec = self.engine_specs.get(&domain.engine_id).ok();

        let deployable_type = engine_conf
            .get("epuworker_type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| spec.map(|s| s.deployable_type.clone()));
        let Some(deployable_type) = deployable_type else {
            warn!(
                domain_id = %domain.domain_id,
                "no deployable type for domain; cannot launch"
            );
            return;
        };
        let site = engine_conf
            .get("force_site")
            .and_then(Value::as_str)
            .map(SiteId::new);
        let allocation = spec.and_then(|s| s.iaas_allocation.clone());

        let mut subscribers = domain.subscribers.clone();
        let own = Subscriber::new(self.service_name.clone(), "instance_info");
        if !subscribers.contains(&own) {
            subscribers.push(own);
        }

        for _ in 0..count {
            let request = ProvisionRequest {
                launch_id: LaunchId::generate(),
                domain_id: Some(domain.domain_id.clone()),
                deployable_type: deployable_type.clone(),
                instance_ids: vec![InstanceId::generate()],
                subscribers: subscribers.clone(),
                site: site.clone(),
                allocation: allocation.clone(),
                vars: None,
                caller: Some(domain.owner.clone()),
            };
            if let Err(e) = self.provisioner.provision(&request).await {
                warn!(
                    domain_id = %domain.domain_id,
                    error = %e,
                    "provision request failed; next tick retries"
                );
                return;
            }
        }
    }

    // ── Recovery ──────────────────────────────────────────────────────────────

    /// On leader acquisition: drop in-memory policy state so engines are
    /// rebuilt from the stored config. No actions are issued until the
    /// next tick; replayed launches are absorbed by launch-id idempotence.
    pub async fn recover(&self) -> Result<(), EpumError> {
        let mut cache = self.engine_cache.lock().await;
        cache.clear();
        let domains = self.store.all_domains().await?;
        info!(domains = domains.len(), "epum recovery complete");
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn instances_for_domain(
        &self,
        domain_id: &DomainId,
    ) -> Result<Vec<InstanceRecord>, EpumError> {
        Ok(self
            .store
            .nodes()
            .await?
            .into_iter()
            .filter(|n| n.domain_id.as_ref() == Some(domain_id))
            .collect())
    }

    async fn live_instance_ids(&self, domain_id: &DomainId) -> Result<Vec<InstanceId>, EpumError> {
        Ok(self
            .instances_for_domain(domain_id)
            .await?
            .into_iter()
            .filter(|i| !i.state.is_terminal())
            .map(|i| i.instance_id)
            .collect())
    }
}

/// Merge `patch` into `base`, one section deep: top-level objects merge
/// key-by-key, everything else replaces.
fn merge_config(base: &mut Value, patch: &Value) {
    let Some(patch_map) = patch.as_object() else { return };
    if !base.is_object() {
        *base = json!({});
    }
    let Some(base_map) = base.as_object_mut() else { return };
    for (key, value) in patch_map {
        match (base_map.get_mut(key), value.as_object()) {
            (Some(Value::Object(existing)), Some(incoming)) => {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
            }
            _ => {
                base_map.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epuctl_bus::{InProcessBus, RecordingNotifier};
    use epuctl_domain::EngineSpec;
    use epuctl_dtrs::{DtDefinition, DtRegistry, MemoryDtrs, SiteMapping};
    use epuctl_iaas::{FakeIaasDriver, IaasDriver, SiteRegistry};
    use epuctl_provisioner::{ProvisionerCore, ProvisionerService};
    use epuctl_store::MemoryStore;

    struct Fixture {
        epum: EpuManagement,
        driver: FakeIaasDriver,
        store: ControlStore,
    }

    async fn fixture() -> Fixture {
        let store = ControlStore::new(Arc::new(MemoryStore::new()));
        let notifier = RecordingNotifier::new();
        let driver = FakeIaasDriver::new();
        let bus = Arc::new(InProcessBus::new());

        let dtrs = MemoryDtrs::new();
        let site = SiteId::new("fake");
        let mut mappings = HashMap::new();
        mappings.insert(
            site.clone(),
            SiteMapping {
                iaas_image: Some("ami-fake".to_string()),
                iaas_allocation: Some("t1.micro".to_string()),
                extra: Map::new(),
            },
        );
        dtrs.add_dt(
            "default",
            "eeagent",
            DtDefinition { mappings, contextualization: None, extra: Map::new() },
        )
        .await
        .unwrap();
        dtrs.add_site(&site, json!({"driver": "fake"})).await.unwrap();

        let mut sites = SiteRegistry::new(site.clone());
        sites.register(site, Arc::new(driver.clone()));

        let provisioner_core = Arc::new(ProvisionerCore::new(
            store.clone(),
            Arc::new(notifier.clone()),
            Arc::new(dtrs),
            Arc::new(sites),
            "default",
        ));
        bus.register("provisioner", Arc::new(ProvisionerService::new(provisioner_core)))
            .await;

        let spec = EngineSpec::new(
            EngineId::new("default"),
            "eeagent",
            4,
            1,
            0,
            1,
            None,
            None,
        )
        .unwrap();
        let engine_specs =
            EngineRegistry::from_specs([spec], Some(EngineId::new("default"))).unwrap();

        let epum = EpuManagement::new(
            store.clone(),
            ProvisionerClient::new(bus.clone(), "provisioner"),
            Arc::new(notifier),
            DecisionEngineRegistry::with_defaults(),
            engine_specs,
            "default",
            Duration::from_secs(60),
            "epum",
        );
        Fixture { epum, driver, store }
    }

    fn domain_config(preserve_n: u32) -> Value {
        json!({
            "general": { "engine_class": "simplest" },
            "health": { "monitor_health": false },
            "engine_conf": {
                "preserve_n": preserve_n,
                "epuworker_type": "eeagent",
                "force_site": "fake",
            },
        })
    }

    fn preserve_patch(n: u32) -> Value {
        json!({ "engine_conf": { "preserve_n": n } })
    }

    #[tokio::test]
    async fn add_list_describe_remove() {
        let f = fixture().await;
        let dom = DomainId::new("dom1");
        f.epum.add_domain(None, &dom, domain_config(0)).await.unwrap();

        assert_eq!(f.epum.list_domains(None).await.unwrap(), vec![dom.clone()]);
        let doc = f.epum.describe_domain(None, &dom).await.unwrap();
        assert_eq!(doc["domain_id"], "dom1");
        assert_eq!(doc["instances"].as_array().unwrap().len(), 0);

        assert!(matches!(
            f.epum.add_domain(None, &dom, domain_config(0)).await,
            Err(EpumError::DomainExists(_))
        ));

        f.epum.remove_domain(None, &dom).await.unwrap();
        f.epum.tick().await;
        assert!(f.epum.list_domains(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_engine_class_is_rejected() {
        let f = fixture().await;
        let config = json!({ "general": { "engine_class": "fancy" }, "engine_conf": {} });
        assert!(matches!(
            f.epum.add_domain(None, &DomainId::new("dom1"), config).await,
            Err(EpumError::UnknownDecisionEngine(_))
        ));
    }

    #[tokio::test]
    async fn scale_up_then_down() {
        let f = fixture().await;
        let dom = DomainId::new("dom1");
        f.epum.add_domain(None, &dom, domain_config(0)).await.unwrap();

        f.epum.tick().await;
        assert!(f.driver.list_nodes().await.unwrap().is_empty());

        f.epum.reconfigure_domain(None, &dom, preserve_patch(5)).await.unwrap();
        f.epum.tick().await;
        assert_eq!(f.driver.list_nodes().await.unwrap().len(), 5);
        let doc = f.epum.describe_domain(None, &dom).await.unwrap();
        assert_eq!(doc["instances"].as_array().unwrap().len(), 5);

        // steady state launches nothing new
        f.epum.tick().await;
        assert_eq!(f.driver.list_nodes().await.unwrap().len(), 5);

        f.epum.reconfigure_domain(None, &dom, preserve_patch(2)).await.unwrap();
        f.epum.tick().await;
        assert_eq!(f.driver.list_nodes().await.unwrap().len(), 2);

        let live = f
            .store
            .nodes()
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.state <= InstanceState::Running)
            .count();
        assert_eq!(live, 2);
    }

    #[tokio::test]
    async fn reconfigure_unknown_domain_errors() {
        let f = fixture().await;
        assert!(matches!(
            f.epum
                .reconfigure_domain(None, &DomainId::new("ghost"), preserve_patch(1))
                .await,
            Err(EpumError::DomainNotFound(_))
        ));
    }

    #[tokio::test]
    async fn removal_cascades_to_instances() {
        let f = fixture().await;
        let dom = DomainId::new("dom1");
        f.epum.add_domain(None, &dom, domain_config(3)).await.unwrap();
        f.epum.tick().await;
        assert_eq!(f.driver.list_nodes().await.unwrap().len(), 3);

        f.epum.remove_domain(None, &dom).await.unwrap();
        f.epum.tick().await;

        assert!(f.driver.list_nodes().await.unwrap().is_empty());
        assert!(f.epum.list_domains(None).await.unwrap().is_empty());
        // records survive, terminal
        for node in f.store.nodes().await.unwrap() {
            assert!(node.state.is_terminal());
        }
    }

    #[tokio::test]
    async fn failed_instance_is_replaced() {
        let f = fixture().await;
        let dom = DomainId::new("dom1");
        f.epum.add_domain(None, &dom, domain_config(2)).await.unwrap();
        f.epum.tick().await;
        assert_eq!(f.driver.list_nodes().await.unwrap().len(), 2);

        // one instance dies
        let victim = f.store.nodes().await.unwrap()[0].instance_id.clone();
        f.store
            .update_node(&victim, |n| n.state = InstanceState::Failed)
            .await
            .unwrap();

        f.epum.tick().await;
        let live = f
            .store
            .nodes()
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.state <= InstanceState::Running)
            .count();
        assert_eq!(live, 2);
    }

    #[tokio::test]
    async fn stale_heartbeat_marks_missing_then_terminates() {
        let f = fixture().await;
        let dom = DomainId::new("dom1");
        let mut config = domain_config(1);
        config["health"]["monitor_health"] = json!(true);
        f.epum.add_domain(None, &dom, config).await.unwrap();
        f.epum.tick().await;

        let id = f.store.nodes().await.unwrap()[0].instance_id.clone();
        // instance running, heartbeat just over the timeout
        f.store
            .update_node(&id, |n| {
                n.state = InstanceState::Running;
                n.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(90));
            })
            .await
            .unwrap();

        f.epum.tick().await;
        let node = f.store.get_node(&id).await.unwrap().unwrap();
        assert_eq!(node.health, InstanceHealth::Missing);
        assert_eq!(node.state, InstanceState::Running, "not yet past grace");

        // now way past the grace window
        f.store
            .update_node(&id, |n| {
                n.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(300));
            })
            .await
            .unwrap();
        f.epum.tick().await;
        let node = f.store.get_node(&id).await.unwrap().unwrap();
        assert!(node.state.is_terminal());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_health() {
        let f = fixture().await;
        let dom = DomainId::new("dom1");
        f.epum.add_domain(None, &dom, domain_config(1)).await.unwrap();
        f.epum.tick().await;

        let node = f.store.nodes().await.unwrap().remove(0);
        let hb = AgentHeartbeat {
            resource_id: epuctl_domain::ResourceId::new(node.instance_id.as_str()),
            node_id: node.instance_id.clone(),
            engine_id: None,
            slot_count: 4,
            processes: vec![],
            timestamp: None,
        };
        f.epum.heartbeat(&hb).await.unwrap();

        let node = f.store.get_node(&node.instance_id).await.unwrap().unwrap();
        assert_eq!(node.health, InstanceHealth::Ok);
        assert!(node.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn sensor_info_lands_on_the_domain() {
        let f = fixture().await;
        let dom = DomainId::new("dom1");
        f.epum.add_domain(None, &dom, domain_config(0)).await.unwrap();

        f.epum
            .sensor_info(json!({
                "domain_id": "dom1",
                "sensor_id": "queue_length",
                "value": 42,
            }))
            .await
            .unwrap();

        let doc = f.epum.describe_domain(None, &dom).await.unwrap();
        assert_eq!(doc["sensor_data"]["queue_length"], 42);
    }

    #[test]
    fn merge_config_is_section_deep() {
        let mut base = json!({
            "general": {"engine_class": "simplest"},
            "engine_conf": {"preserve_n": 0, "epuworker_type": "eeagent"},
        });
        merge_config(&mut base, &json!({"engine_conf": {"preserve_n": 5}}));
        assert_eq!(base["engine_conf"]["preserve_n"], 5);
        assert_eq!(base["engine_conf"]["epuworker_type"], "eeagent");
        assert_eq!(base["general"]["engine_class"], "simplest");

        merge_config(&mut base, &json!({"health": {"monitor_health": true}}));
        assert_eq!(base["health"]["monitor_health"], true);
    }
}
