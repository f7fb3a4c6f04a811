use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use epuctl_bus::{AgentHeartbeat, AgentProcess, AgentProcessStatus, DispatchRequest, EpumClient, Notifier};
use epuctl_domain::{
    domain_id_from_engine, EngineId, EngineRegistry, EngineSpec, InstanceId, ProcessConstraints,
    ProcessRecord, ProcessState, QueueEntry, ResourceId, ResourceRecord, RestartPolicy, Upid,
};
use epuctl_store::ControlStore;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::agents::EeAgentClient;
use crate::error::PdError;
use crate::matchmaker::{choose_resource, compute_need};

const EVENT_SOURCE: &str = "pd";

/// Resource extra-field flag set by `evacuate_node`; an evacuated resource
/// is never re-enabled by heartbeats.
const EVACUATED_FLAG: &str = "evacuated";

/// The process dispatcher: slot-based scheduler over EEAgent resources,
/// plus the autoscale need signal it feeds back to the EPUM.
pub struct PdCore {
    store: ControlStore,
    engine_specs: EngineRegistry,
    epum: EpumClient,
    agents: Arc<dyn EeAgentClient>,
    notifier: Arc<dyn Notifier>,
    /// Owner under which the `pd_domain_*` domains are registered.
    owner: String,
    agent_timeout: Duration,
    max_restarts: u32,
    /// Last need written per engine; reconfigure is only sent on change.
    last_need: Mutex<HashMap<EngineId, u32>>,
    /// Engines whose EPUM domain has been ensured this incarnation.
    ensured_domains: Mutex<HashSet<EngineId>>,
    /// Agents are not expired before this instant (recovery grace).
    expiry_holdoff: Mutex<Option<DateTime<Utc>>>,
}

impl PdCore {
    pub fn new(
        store: ControlStore,
        engine_specs: EngineRegistry,
        epum: EpumClient,
        agents: Arc<dyn EeAgentClient>,
        notifier: Arc<dyn Notifier>,
        owner: impl Into<String>,
        agent_timeout: Duration,
        max_restarts: u32,
    ) -> Self {
        PdCore {
            store,
            engine_specs,
            epum,
            agents,
            notifier,
            owner: owner.into(),
            agent_timeout,
            max_restarts,
            last_need: Mutex::new(HashMap::new()),
            ensured_domains: Mutex::new(HashSet::new()),
            expiry_holdoff: Mutex::new(None),
        }
    }

    fn engine_for_constraints(&self, constraints: &ProcessConstraints) -> Result<&EngineSpec, PdError> {
        let engine_id = constraints
            .engine_id
            .clone()
            .unwrap_or_else(|| EngineId::new("default"));
        Ok(self.engine_specs.get(&engine_id)?)
    }

    async fn notify_process(&self, process: &ProcessRecord) -> Result<(), PdError> {
        if process.subscribers.is_empty() {
            return Ok(());
        }
        let value = serde_json::to_value(process).map_err(epuctl_store::StoreError::from)?;
        self.notifier.send_record(value, &process.subscribers).await;
        Ok(())
    }

    // ── Client operations ─────────────────────────────────────────────────────

    pub async fn dispatch_process(&self, request: &DispatchRequest) -> Result<ProcessRecord, PdError> {
        if let Some(existing) = self.store.get_process(&request.upid).await? {
            if existing.definition == request.definition {
                debug!(upid = %request.upid, "dispatch replay, returning existing process");
                return Ok(existing);
            }
            return Err(PdError::ProcessConflict(request.upid.to_string()));
        }

        let engine = self.engine_for_constraints(&request.constraints)?.engine_id.clone();
        let record = ProcessRecord {
            upid: request.upid.clone(),
            definition: request.definition.clone(),
            state: ProcessState::Requested,
            constraints: request.constraints.clone(),
            assigned_resource: None,
            round: 0,
            restarts_remaining: self.max_restarts,
            restart_policy: request.restart_policy,
            priority: request.priority,
            enqueued_at: Some(Utc::now()),
            starved_rounds: 0,
            subscribers: request.subscribers.clone(),
            extra: Map::new(),
        };
        self.store.create_process(&record).await?;
        self.enqueue(&engine, &record).await?;
        self.notify_process(&record).await?;

        let mut extra = Map::new();
        extra.insert("upid".to_string(), Value::from(record.upid.as_str()));
        extra.insert("engine".to_string(), Value::from(engine.as_str()));
        if let Err(e) = epuctl_events::emit(EVENT_SOURCE, "process_dispatched", extra) {
            warn!(error = %e, "event emission failed");
        }
        info!(upid = %record.upid, %engine, "process dispatched");
        Ok(record)
    }

    pub async fn terminate_process(&self, upid: &Upid) -> Result<ProcessRecord, PdError> {
        let process = self
            .store
            .get_process(upid)
            .await?
            .ok_or_else(|| PdError::ProcessNotFound(upid.to_string()))?;
        if process.state.is_terminal() {
            return Ok(process);
        }

        if let Some(resource_id) = process.assigned_resource.clone() {
            let marked = self
                .store
                .update_process(upid, |p| p.state = ProcessState::Terminating)
                .await?;
            self.notify_process(&marked).await?;

            if let Err(e) = self.agents.terminate_process(&resource_id, upid).await {
                warn!(%upid, error = %e, "agent terminate call failed");
            }
            self.release_slot(&resource_id, upid).await?;
        } else {
            let engine = self.engine_for_constraints(&process.constraints)?.engine_id.clone();
            self.remove_queued(&engine, process.priority, upid).await?;
        }

        let done = self
            .store
            .update_process(upid, |p| {
                p.state = ProcessState::Terminated;
                p.assigned_resource = None;
            })
            .await?;
        self.notify_process(&done).await?;
        info!(%upid, "process terminated");
        Ok(done)
    }

    /// Operator restart: put the process back in the queue with a fresh
    /// restart budget and a bumped round.
    pub async fn restart_process(&self, upid: &Upid) -> Result<ProcessRecord, PdError> {
        let process = self
            .store
            .get_process(upid)
            .await?
            .ok_or_else(|| PdError::ProcessNotFound(upid.to_string()))?;

        if let Some(resource_id) = process.assigned_resource.clone() {
            if let Err(e) = self.agents.terminate_process(&resource_id, upid).await {
                warn!(%upid, error = %e, "agent terminate call failed");
            }
            self.release_slot(&resource_id, upid).await?;
        }

        let engine = self.engine_for_constraints(&process.constraints)?.engine_id.clone();
        let max_restarts = self.max_restarts;
        let requeued = self
            .store
            .update_process(upid, |p| {
                p.state = ProcessState::Requested;
                p.assigned_resource = None;
                p.round += 1;
                p.restarts_remaining = max_restarts;
                p.starved_rounds = 0;
                p.enqueued_at = Some(Utc::now());
            })
            .await?;
        self.enqueue(&engine, &requeued).await?;
        self.notify_process(&requeued).await?;
        info!(%upid, round = requeued.round, "process restarted");
        Ok(requeued)
    }

    pub async fn describe_process(&self, upid: &Upid) -> Result<Option<ProcessRecord>, PdError> {
        Ok(self.store.get_process(upid).await?)
    }

    pub async fn describe_processes(&self) -> Result<Vec<ProcessRecord>, PdError> {
        Ok(self.store.processes().await?)
    }

    /// Drain a node: disable its resource and reschedule everything it
    /// held, restart budget permitting.
    pub async fn evacuate_node(&self, node_id: &InstanceId) -> Result<(), PdError> {
        let resource = self
            .store
            .resources()
            .await?
            .into_iter()
            .find(|r| &r.node_id == node_id)
            .ok_or_else(|| PdError::ResourceNotFound(node_id.to_string()))?;

        let held = resource.assigned.clone();
        self.store
            .update_resource(&resource.resource_id, |r| {
                r.enabled = false;
                r.assigned.clear();
                r.extra.insert(EVACUATED_FLAG.to_string(), Value::Bool(true));
            })
            .await?;
        info!(%node_id, held = held.len(), "node evacuated");

        for upid in held {
            self.requeue_or_fail(&upid, true).await?;
        }
        Ok(())
    }

    // ── Heartbeats ────────────────────────────────────────────────────────────

    pub async fn heartbeat(&self, heartbeat: &AgentHeartbeat) -> Result<(), PdError> {
        let now = Utc::now();
        let resource_id = heartbeat.resource_id.clone();

        match self.store.get_resource(&resource_id).await? {
            None => self.register_resource(heartbeat, now).await?,
            Some(_) => {
                self.store
                    .update_resource(&resource_id, |r| {
                        r.last_heartbeat = now;
                        let evacuated = r
                            .extra
                            .get(EVACUATED_FLAG)
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if !r.enabled && !evacuated {
                            // the agent came back before we reaped it
                            r.enabled = true;
                        }
                    })
                    .await?;
            }
        }
        self.store
            .agent_heartbeat(&resource_id, json!({ "node_id": &heartbeat.node_id, "at": now }))
            .await?;

        for agent_process in &heartbeat.processes {
            if let Err(e) = self.apply_agent_process(&resource_id, agent_process).await {
                error!(upid = %agent_process.upid, error = %e, "heartbeat process update failed");
            }
        }
        Ok(())
    }

    /// First contact from an agent creates its resource record.
    async fn register_resource(
        &self,
        heartbeat: &AgentHeartbeat,
        now: DateTime<Utc>,
    ) -> Result<(), PdError> {
        let engine_id = match &heartbeat.engine_id {
            Some(engine_id) => engine_id.clone(),
            None => self.engine_from_node(&heartbeat.node_id).await?,
        };
        let spec_slots = self.engine_specs.get(&engine_id).map(|s| s.slots).unwrap_or(1);
        let slot_count = if heartbeat.slot_count > 0 { heartbeat.slot_count } else { spec_slots };

        let record = ResourceRecord {
            resource_id: heartbeat.resource_id.clone(),
            node_id: heartbeat.node_id.clone(),
            engine_id: engine_id.clone(),
            slot_count,
            assigned: vec![],
            enabled: true,
            last_heartbeat: now,
            extra: Map::new(),
        };
        self.store.put_resource(&record).await?;
        info!(
            resource_id = %record.resource_id,
            engine = %engine_id,
            slot_count,
            "resource registered"
        );

        let mut extra = Map::new();
        extra.insert("resource_id".to_string(), Value::from(record.resource_id.as_str()));
        extra.insert("engine".to_string(), Value::from(engine_id.as_str()));
        if let Err(e) = epuctl_events::emit(EVENT_SOURCE, "resource_registered", extra) {
            warn!(error = %e, "event emission failed");
        }
        Ok(())
    }

    /// The heartbeat names a node; the node record names its domain; the
    /// domain id names the engine.
    async fn engine_from_node(&self, node_id: &InstanceId) -> Result<EngineId, PdError> {
        if let Some(node) = self.store.get_node(node_id).await? {
            if let Some(domain_id) = node.domain_id {
                if let Ok(engine_id) = epuctl_domain::engine_id_from_domain(&domain_id) {
                    return Ok(engine_id);
                }
            }
        }
        Ok(self
            .engine_specs
            .default_engine()
            .cloned()
            .unwrap_or_else(|| EngineId::new("default")))
    }

    async fn apply_agent_process(
        &self,
        resource_id: &ResourceId,
        agent_process: &AgentProcess,
    ) -> Result<(), PdError> {
        let Some(process) = self.store.get_process(&agent_process.upid).await? else {
            debug!(upid = %agent_process.upid, "agent reports unknown process");
            return Ok(());
        };

        match agent_process.status {
            AgentProcessStatus::Running => {
                let confirms = process.state == ProcessState::Assigned
                    && process.assigned_resource.as_ref() == Some(resource_id)
                    && process.round == agent_process.round;
                if confirms {
                    let running = self
                        .store
                        .update_process(&process.upid, |p| p.state = ProcessState::Running)
                        .await?;
                    self.notify_process(&running).await?;
                    debug!(upid = %process.upid, "process confirmed running");
                }
            }
            AgentProcessStatus::Exited { code } => {
                debug!(upid = %process.upid, code, "process exited");
                self.handle_stopped(&process, resource_id, true).await?;
            }
            AgentProcessStatus::Error => {
                warn!(upid = %process.upid, "process errored on agent");
                self.handle_stopped(&process, resource_id, false).await?;
            }
        }
        Ok(())
    }

    /// A process stopped on a live agent, cleanly or not.
    async fn handle_stopped(
        &self,
        process: &ProcessRecord,
        resource_id: &ResourceId,
        clean_exit: bool,
    ) -> Result<(), PdError> {
        match process.state {
            ProcessState::Terminating => {
                self.release_slot(resource_id, &process.upid).await?;
                let done = self
                    .store
                    .update_process(&process.upid, |p| {
                        p.state = ProcessState::Terminated;
                        p.assigned_resource = None;
                    })
                    .await?;
                self.notify_process(&done).await?;
                return Ok(());
            }
            ProcessState::Assigned | ProcessState::Running => {}
            _ => return Ok(()),
        }

        self.release_slot(resource_id, &process.upid).await?;

        let restart = match (clean_exit, process.restart_policy) {
            (true, RestartPolicy::Always | RestartPolicy::OnExitOnly) => true,
            (true, RestartPolicy::Never) => false,
            // a crash restarts only under ALWAYS
            (false, RestartPolicy::Always) => true,
            (false, _) => false,
        };

        if restart && process.restarts_remaining > 0 {
            self.requeue(&process.upid).await?;
        } else {
            let end_state = if clean_exit { ProcessState::Exited } else { ProcessState::Failed };
            let done = self
                .store
                .update_process(&process.upid, |p| {
                    p.state = end_state;
                    p.assigned_resource = None;
                })
                .await?;
            self.notify_process(&done).await?;
        }
        Ok(())
    }

    // ── Tick ──────────────────────────────────────────────────────────────────

    /// One scheduler pass: expire dead agents, place queued processes,
    /// refresh the need signal. Sub-pass errors never abort the tick.
    pub async fn tick(&self) {
        let now = Utc::now();
        if let Err(e) = self.expire_agents(now).await {
            error!(error = %e, "agent expiry pass failed");
        }
        if let Err(e) = self.match_queued(now).await {
            error!(error = %e, "matchmaking pass failed");
        }
        if let Err(e) = self.update_needs().await {
            error!(error = %e, "need update pass failed");
        }
    }

    async fn expire_agents(&self, now: DateTime<Utc>) -> Result<(), PdError> {
        {
            let holdoff = self.expiry_holdoff.lock().await;
            if let Some(deadline) = *holdoff {
                if now < deadline {
                    return Ok(());
                }
            }
        }

        let timeout = self.agent_timeout.as_secs() as i64;
        for resource in self.store.resources().await? {
            if !resource.enabled {
                continue;
            }
            let stale = now.signed_duration_since(resource.last_heartbeat).num_seconds();
            if stale <= timeout {
                continue;
            }

            warn!(
                resource_id = %resource.resource_id,
                stale_secs = stale,
                "agent heartbeat expired, disabling resource"
            );
            let held = resource.assigned.clone();
            self.store
                .update_resource(&resource.resource_id, |r| {
                    r.enabled = false;
                    r.assigned.clear();
                })
                .await?;
            self.store.delete_agent(&resource.resource_id).await?;

            let mut extra = Map::new();
            extra.insert(
                "resource_id".to_string(),
                Value::from(resource.resource_id.as_str()),
            );
            extra.insert("held".to_string(), Value::from(held.len() as u64));
            if let Err(e) = epuctl_events::emit(EVENT_SOURCE, "agent_timeout", extra) {
                warn!(error = %e, "event emission failed");
            }

            // dead agent: not a clean exit
            for upid in held {
                self.requeue_or_fail(&upid, false).await?;
            }
        }
        Ok(())
    }

    /// Restart-policy disposition for a process whose agent is gone.
    /// `administrative` relaxes the policy check (evacuation moves
    /// everything the budget allows).
    async fn requeue_or_fail(&self, upid: &Upid, administrative: bool) -> Result<(), PdError> {
        let Some(process) = self.store.get_process(upid).await? else { return Ok(()) };
        if !matches!(process.state, ProcessState::Assigned | ProcessState::Running) {
            return Ok(());
        }

        let restart = administrative || process.restart_policy == RestartPolicy::Always;
        if restart && process.restarts_remaining > 0 {
            self.requeue(upid).await?;
        } else {
            let done = self
                .store
                .update_process(upid, |p| {
                    p.state = ProcessState::Failed;
                    p.assigned_resource = None;
                })
                .await?;
            self.notify_process(&done).await?;
        }
        Ok(())
    }

    /// Put a process back in its queue with the round bumped and one unit
    /// of restart budget spent.
    async fn requeue(&self, upid: &Upid) -> Result<(), PdError> {
        let requeued = self
            .store
            .update_process(upid, |p| {
                p.state = ProcessState::Requested;
                p.assigned_resource = None;
                p.round += 1;
                p.restarts_remaining = p.restarts_remaining.saturating_sub(1);
                p.enqueued_at = Some(Utc::now());
            })
            .await?;
        let engine = self.engine_for_constraints(&requeued.constraints)?.engine_id.clone();
        self.enqueue(&engine, &requeued).await?;
        self.notify_process(&requeued).await?;
        info!(%upid, round = requeued.round, "process requeued");
        Ok(())
    }

    async fn match_queued(&self, now: DateTime<Utc>) -> Result<(), PdError> {
        let timeout = self.agent_timeout.as_secs() as i64;
        let mut resources: Vec<(ResourceRecord, u32)> = self
            .store
            .resources()
            .await?
            .into_iter()
            .filter(|r| {
                r.enabled
                    && now.signed_duration_since(r.last_heartbeat).num_seconds() <= timeout
            })
            .map(|r| {
                let free = r.free_slots();
                (r, free)
            })
            .collect();

        let specs: Vec<EngineSpec> = self.engine_specs.iter().cloned().collect();
        for spec in specs {
            for (priority, entries) in self.store.queues_for_engine(&spec.engine_id).await? {
                let mut retained: Vec<QueueEntry> = Vec::with_capacity(entries.len());
                let mut changed = false;

                for entry in entries {
                    let Some(process) = self.store.get_process(&entry.upid).await? else {
                        changed = true;
                        continue;
                    };
                    if !matches!(process.state, ProcessState::Requested | ProcessState::Waiting) {
                        // stale entry left behind by a terminate or assign
                        changed = true;
                        continue;
                    }

                    let chosen = choose_resource(&process, &resources, &spec)
                        .map(|r| r.resource_id.clone());
                    let Some(resource_id) = chosen else {
                        let starved = self
                            .store
                            .update_process(&entry.upid, |p| {
                                p.state = ProcessState::Waiting;
                                p.starved_rounds += 1;
                            })
                            .await?;
                        if starved.starved_rounds == 1 {
                            self.notify_process(&starved).await?;
                        }
                        retained.push(entry);
                        continue;
                    };

                    // book the slot locally so later picks see it taken
                    if let Some(slot) =
                        resources.iter_mut().find(|(r, _)| r.resource_id == resource_id)
                    {
                        slot.0.assigned.push(process.upid.clone());
                        slot.1 = slot.1.saturating_sub(1);
                    }
                    let upid = process.upid.clone();
                    self.store
                        .update_resource(&resource_id, |r| {
                            if !r.assigned.contains(&upid) {
                                r.assigned.push(upid.clone());
                            }
                        })
                        .await?;

                    let assigned_to = resource_id.clone();
                    let assigned = self
                        .store
                        .update_process(&entry.upid, |p| {
                            p.state = ProcessState::Assigned;
                            p.assigned_resource = Some(assigned_to.clone());
                            p.starved_rounds = 0;
                        })
                        .await?;
                    self.notify_process(&assigned).await?;
                    debug!(
                        upid = %assigned.upid,
                        resource_id = %resource_id,
                        round = assigned.round,
                        "process assigned"
                    );

                    if let Err(e) = self.agents.launch_process(&resource_id, &assigned).await {
                        // leave it ASSIGNED; the agent timeout path requeues
                        warn!(upid = %assigned.upid, error = %e, "agent launch call failed");
                    }
                    changed = true;
                }

                if changed {
                    self.store.put_queue(&spec.engine_id, priority, &retained).await?;
                }
            }
        }
        Ok(())
    }

    /// Recompute the per-engine need and write it into the matching EPUM
    /// domain, but only when the value moved.
    async fn update_needs(&self) -> Result<(), PdError> {
        let processes = self.store.processes().await?;
        let mut demand: HashMap<EngineId, u32> = HashMap::new();
        for process in &processes {
            if !process.state.is_active() {
                continue;
            }
            let engine = self.engine_for_constraints(&process.constraints)?.engine_id.clone();
            *demand.entry(engine).or_default() += 1;
        }

        let specs: Vec<EngineSpec> = self.engine_specs.iter().cloned().collect();
        for spec in specs {
            let need = compute_need(demand.get(&spec.engine_id).copied().unwrap_or(0), &spec);

            {
                // fresh domains start at zero, so an unsent zero is a no-op
                let cache = self.last_need.lock().await;
                if cache.get(&spec.engine_id).copied().unwrap_or(0) == need {
                    continue;
                }
            }

            self.ensure_domain(&spec).await?;
            let domain_id = domain_id_from_engine(&spec.engine_id)?;
            let patch = json!({ "engine_conf": { "preserve_n": need } });
            match self.epum.reconfigure_domain(Some(&self.owner), &domain_id, patch).await {
                Ok(()) => {
                    info!(engine = %spec.engine_id, need, "need updated");
                    let mut cache = self.last_need.lock().await;
                    cache.insert(spec.engine_id.clone(), need);
                }
                Err(e) => warn!(engine = %spec.engine_id, error = %e, "need update failed"),
            }
        }
        Ok(())
    }

    /// Create the engine's EPUM domain if this incarnation has not yet
    /// confirmed it exists. An already-present domain is fine.
    async fn ensure_domain(&self, spec: &EngineSpec) -> Result<(), PdError> {
        {
            let ensured = self.ensured_domains.lock().await;
            if ensured.contains(&spec.engine_id) {
                return Ok(());
            }
        }
        let domain_id = domain_id_from_engine(&spec.engine_id)?;
        let config = json!({
            "general": { "engine_class": "simplest" },
            "health": { "monitor_health": false },
            "engine_conf": {
                "preserve_n": 0,
                "epuworker_type": &spec.deployable_type,
            },
        });
        if let Err(e) = self.epum.add_domain(Some(&self.owner), &domain_id, config).await {
            debug!(%domain_id, error = %e, "add_domain (likely already exists)");
        }
        let mut ensured = self.ensured_domains.lock().await;
        ensured.insert(spec.engine_id.clone());
        Ok(())
    }

    // ── Recovery ──────────────────────────────────────────────────────────────

    /// On leader acquisition: queues and resources are reloaded from the
    /// store on demand; agents get a full `agent_timeout` of grace before
    /// expiry so a doer hand-off does not reap live agents.
    pub async fn recover(&self) -> Result<(), PdError> {
        {
            let mut holdoff = self.expiry_holdoff.lock().await;
            *holdoff = Some(Utc::now() + chrono::Duration::seconds(self.agent_timeout.as_secs() as i64));
        }
        {
            let mut cache = self.last_need.lock().await;
            cache.clear();
        }
        {
            let mut ensured = self.ensured_domains.lock().await;
            ensured.clear();
        }
        let resources = self.store.resources().await?;
        let processes = self.store.processes().await?;
        info!(
            resources = resources.len(),
            processes = processes.len(),
            "pd recovery complete"
        );
        Ok(())
    }

    // ── Queue plumbing ────────────────────────────────────────────────────────

    async fn enqueue(&self, engine: &EngineId, process: &ProcessRecord) -> Result<(), PdError> {
        let mut entries = self.store.get_queue(engine, process.priority).await?;
        if !entries.iter().any(|e| e.upid == process.upid) {
            entries.push(QueueEntry {
                upid: process.upid.clone(),
                priority: process.priority,
                enqueued_at: process.enqueued_at.unwrap_or_else(Utc::now),
            });
            self.store.put_queue(engine, process.priority, &entries).await?;
        }
        Ok(())
    }

    async fn remove_queued(
        &self,
        engine: &EngineId,
        priority: u8,
        upid: &Upid,
    ) -> Result<(), PdError> {
        let mut entries = self.store.get_queue(engine, priority).await?;
        let before = entries.len();
        entries.retain(|e| &e.upid != upid);
        if entries.len() != before {
            self.store.put_queue(engine, priority, &entries).await?;
        }
        Ok(())
    }

    async fn release_slot(&self, resource_id: &ResourceId, upid: &Upid) -> Result<(), PdError> {
        let upid = upid.clone();
        match self
            .store
            .update_resource(resource_id, move |r| r.assigned.retain(|u| u != &upid))
            .await
        {
            Ok(_) => Ok(()),
            Err(epuctl_store::StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epuctl_bus::{BusHandler, InProcessBus, RecordingNotifier};
    use epuctl_domain::Subscriber;
    use epuctl_store::MemoryStore;
    use std::sync::Mutex as StdMutex;

    use crate::agents::RecordingAgentClient;

    /// Stands in for the EPUM service; records every call.
    #[derive(Clone, Default)]
    struct FakeEpum {
        calls: Arc<StdMutex<Vec<(String, Value)>>>,
    }

    impl FakeEpum {
        fn reconfigures(&self) -> Vec<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(op, _)| op == "reconfigure_domain")
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl BusHandler for FakeEpum {
        async fn handle(&self, operation: &str, payload: Value) -> Result<Value, epuctl_bus::BusError> {
            self.calls.lock().unwrap().push((operation.to_string(), payload));
            Ok(Value::Null)
        }
    }

    struct Fixture {
        core: PdCore,
        store: ControlStore,
        agents: RecordingAgentClient,
        epum: FakeEpum,
    }

    async fn fixture_with(max_restarts: u32) -> Fixture {
        let store = ControlStore::new(Arc::new(MemoryStore::new()));
        let agents = RecordingAgentClient::new();
        let epum = FakeEpum::default();

        let bus = Arc::new(InProcessBus::new());
        bus.register("epum", Arc::new(epum.clone())).await;

        let default = EngineSpec::new(
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
        let bigmem = EngineSpec::new(
            EngineId::new("bigmem"),
            "eeagent-bigmem",
            2,
            1,
            0,
            0,
            None,
            Some(3),
        )
        .unwrap();
        let specs =
            EngineRegistry::from_specs([default, bigmem], Some(EngineId::new("default"))).unwrap();

        let core = PdCore::new(
            store.clone(),
            specs,
            EpumClient::new(bus, "epum"),
            Arc::new(agents.clone()),
            Arc::new(RecordingNotifier::new()),
            "default",
            Duration::from_secs(60),
            max_restarts,
        );
        Fixture { core, store, agents, epum }
    }

    async fn fixture() -> Fixture {
        fixture_with(3).await
    }

    fn dispatch(upid: &str, priority: u8, policy: RestartPolicy) -> DispatchRequest {
        DispatchRequest {
            upid: Upid::new(upid),
            definition: json!({"exec": "sleep", "argv": ["60"]}),
            constraints: ProcessConstraints {
                engine_id: Some(EngineId::new("default")),
                host: None,
                extra: Map::new(),
            },
            restart_policy: policy,
            priority,
            subscribers: vec![Subscriber::new("sub", "process_info")],
        }
    }

    fn heartbeat(resource: &str, slots: u32, processes: Vec<AgentProcess>) -> AgentHeartbeat {
        AgentHeartbeat {
            resource_id: ResourceId::new(resource),
            node_id: InstanceId::new(resource),
            engine_id: Some(EngineId::new("default")),
            slot_count: slots,
            processes,
            timestamp: None,
        }
    }

    fn running(upid: &str, round: u32) -> AgentProcess {
        AgentProcess { upid: Upid::new(upid), round, status: AgentProcessStatus::Running }
    }

    fn exited(upid: &str, round: u32) -> AgentProcess {
        AgentProcess { upid: Upid::new(upid), round, status: AgentProcessStatus::Exited { code: 0 } }
    }

    async fn age_resource(store: &ControlStore, resource: &str, secs: i64) {
        store
            .update_resource(&ResourceId::new(resource), |r| {
                r.last_heartbeat = Utc::now() - chrono::Duration::seconds(secs);
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispatch_queues_and_waits_without_resources() {
        let f = fixture().await;
        let record = f.core.dispatch_process(&dispatch("p1", 0, RestartPolicy::Always)).await.unwrap();
        assert_eq!(record.state, ProcessState::Requested);
        assert_eq!(record.restarts_remaining, 3);

        f.core.tick().await;
        let p = f.core.describe_process(&Upid::new("p1")).await.unwrap().unwrap();
        assert_eq!(p.state, ProcessState::Waiting);
        assert_eq!(p.starved_rounds, 1);

        f.core.tick().await;
        let p = f.core.describe_process(&Upid::new("p1")).await.unwrap().unwrap();
        assert_eq!(p.starved_rounds, 2);
    }

    #[tokio::test]
    async fn dispatch_is_idempotent_but_conflicts_on_changed_definition() {
        let f = fixture().await;
        let req = dispatch("p1", 0, RestartPolicy::Always);
        f.core.dispatch_process(&req).await.unwrap();
        f.core.dispatch_process(&req).await.unwrap();
        assert_eq!(f.core.describe_processes().await.unwrap().len(), 1);

        let mut changed = req.clone();
        changed.definition = json!({"exec": "other"});
        assert!(matches!(
            f.core.dispatch_process(&changed).await,
            Err(PdError::ProcessConflict(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_registers_then_matchmaker_assigns() {
        let f = fixture().await;
        f.core.dispatch_process(&dispatch("p1", 0, RestartPolicy::Always)).await.unwrap();
        f.core.heartbeat(&heartbeat("r1", 4, vec![])).await.unwrap();

        f.core.tick().await;

        let p = f.core.describe_process(&Upid::new("p1")).await.unwrap().unwrap();
        assert_eq!(p.state, ProcessState::Assigned);
        assert_eq!(p.assigned_resource, Some(ResourceId::new("r1")));

        let r = f.store.get_resource(&ResourceId::new("r1")).await.unwrap().unwrap();
        assert_eq!(r.assigned, vec![Upid::new("p1")]);

        assert_eq!(f.agents.launches().len(), 1);
        assert_eq!(f.agents.launches()[0].1, Upid::new("p1"));

        // the agent echoing the upid confirms RUNNING
        f.core.heartbeat(&heartbeat("r1", 4, vec![running("p1", 0)])).await.unwrap();
        let p = f.core.describe_process(&Upid::new("p1")).await.unwrap().unwrap();
        assert_eq!(p.state, ProcessState::Running);
    }

    #[tokio::test]
    async fn higher_priority_wins_the_last_slot() {
        let f = fixture().await;
        f.core.dispatch_process(&dispatch("low", 0, RestartPolicy::Always)).await.unwrap();
        f.core.dispatch_process(&dispatch("high", 5, RestartPolicy::Always)).await.unwrap();
        f.core.heartbeat(&heartbeat("r1", 1, vec![])).await.unwrap();

        f.core.tick().await;

        let high = f.core.describe_process(&Upid::new("high")).await.unwrap().unwrap();
        assert_eq!(high.state, ProcessState::Assigned);
        let low = f.core.describe_process(&Upid::new("low")).await.unwrap().unwrap();
        assert_eq!(low.state, ProcessState::Waiting);
    }

    #[tokio::test]
    async fn fifo_within_a_priority() {
        let f = fixture().await;
        f.core.dispatch_process(&dispatch("first", 0, RestartPolicy::Always)).await.unwrap();
        f.core.dispatch_process(&dispatch("second", 0, RestartPolicy::Always)).await.unwrap();
        f.core.heartbeat(&heartbeat("r1", 1, vec![])).await.unwrap();

        f.core.tick().await;

        let first = f.core.describe_process(&Upid::new("first")).await.unwrap().unwrap();
        assert_eq!(first.state, ProcessState::Assigned);
        let second = f.core.describe_process(&Upid::new("second")).await.unwrap().unwrap();
        assert_eq!(second.state, ProcessState::Waiting);
    }

    #[tokio::test]
    async fn need_is_written_only_on_change() {
        let f = fixture().await;
        f.core.tick().await;
        // default engine: base_need 1, bigmem: 0
        let first = f.epum.reconfigures();
        assert_eq!(first.len(), 1, "only the nonzero need is new: {:?}", first);
        assert_eq!(first[0]["config"]["engine_conf"]["preserve_n"], 1);
        assert_eq!(first[0]["domain_id"], "pd_domain_default");

        f.core.tick().await;
        assert_eq!(f.epum.reconfigures().len(), 1, "unchanged need is not re-sent");

        for i in 0..5 {
            f.core
                .dispatch_process(&dispatch(&format!("p{}", i), 0, RestartPolicy::Always))
                .await
                .unwrap();
        }
        f.core.tick().await;
        let all = f.epum.reconfigures();
        // max(1, ceil(5/4)) = 2
        assert_eq!(all.last().unwrap()["config"]["engine_conf"]["preserve_n"], 2);
    }

    #[tokio::test]
    async fn dead_agent_requeues_always_and_fails_on_exit_only() {
        let f = fixture().await;
        for upid in ["a1", "a2", "a3"] {
            f.core.dispatch_process(&dispatch(upid, 0, RestartPolicy::Always)).await.unwrap();
        }
        f.core.dispatch_process(&dispatch("oe", 0, RestartPolicy::OnExitOnly)).await.unwrap();
        f.core.heartbeat(&heartbeat("r1", 4, vec![])).await.unwrap();
        f.core.tick().await;
        f.core
            .heartbeat(&heartbeat(
                "r1",
                4,
                vec![running("a1", 0), running("a2", 0), running("a3", 0), running("oe", 0)],
            ))
            .await
            .unwrap();

        // the agent goes silent past the timeout
        age_resource(&f.store, "r1", 120).await;
        f.core.tick().await;

        let r = f.store.get_resource(&ResourceId::new("r1")).await.unwrap().unwrap();
        assert!(!r.enabled);
        assert!(r.assigned.is_empty());

        for upid in ["a1", "a2", "a3"] {
            let p = f.core.describe_process(&Upid::new(upid)).await.unwrap().unwrap();
            assert_eq!(p.round, 1, "{} requeued with a bumped round", upid);
            assert!(
                matches!(p.state, ProcessState::Requested | ProcessState::Waiting),
                "{} should be queued again, is {}",
                upid,
                p.state
            );
            assert_eq!(p.restarts_remaining, 2);
        }

        // a dead agent is not a clean exit
        let oe = f.core.describe_process(&Upid::new("oe")).await.unwrap().unwrap();
        assert_eq!(oe.state, ProcessState::Failed);
    }

    #[tokio::test]
    async fn restart_budget_falls_through_to_failed() {
        let f = fixture_with(1).await;
        f.core.dispatch_process(&dispatch("p1", 0, RestartPolicy::Always)).await.unwrap();
        f.core.heartbeat(&heartbeat("r1", 4, vec![])).await.unwrap();
        f.core.tick().await;

        age_resource(&f.store, "r1", 120).await;
        f.core.tick().await;
        let p = f.core.describe_process(&Upid::new("p1")).await.unwrap().unwrap();
        assert_eq!(p.round, 1);
        assert_eq!(p.restarts_remaining, 0);

        // agent comes back, process is placed again
        f.core.heartbeat(&heartbeat("r1", 4, vec![])).await.unwrap();
        f.core.tick().await;
        let p = f.core.describe_process(&Upid::new("p1")).await.unwrap().unwrap();
        assert_eq!(p.state, ProcessState::Assigned);

        // second death exhausts the budget
        age_resource(&f.store, "r1", 120).await;
        f.core.tick().await;
        let p = f.core.describe_process(&Upid::new("p1")).await.unwrap().unwrap();
        assert_eq!(p.state, ProcessState::Failed);
    }

    #[tokio::test]
    async fn clean_exit_follows_policy() {
        let f = fixture().await;
        f.core.dispatch_process(&dispatch("always", 0, RestartPolicy::Always)).await.unwrap();
        f.core.dispatch_process(&dispatch("oe", 0, RestartPolicy::OnExitOnly)).await.unwrap();
        f.core.dispatch_process(&dispatch("never", 0, RestartPolicy::Never)).await.unwrap();
        f.core.heartbeat(&heartbeat("r1", 4, vec![])).await.unwrap();
        f.core.tick().await;
        f.core
            .heartbeat(&heartbeat(
                "r1",
                4,
                vec![running("always", 0), running("oe", 0), running("never", 0)],
            ))
            .await
            .unwrap();

        f.core
            .heartbeat(&heartbeat(
                "r1",
                4,
                vec![exited("always", 0), exited("oe", 0), exited("never", 0)],
            ))
            .await
            .unwrap();

        let always = f.core.describe_process(&Upid::new("always")).await.unwrap().unwrap();
        assert_eq!(always.round, 1);
        assert_eq!(always.state, ProcessState::Requested);

        let oe = f.core.describe_process(&Upid::new("oe")).await.unwrap().unwrap();
        assert_eq!(oe.round, 1, "clean exit restarts ON_EXIT_ONLY");

        let never = f.core.describe_process(&Upid::new("never")).await.unwrap().unwrap();
        assert_eq!(never.state, ProcessState::Exited);
    }

    #[tokio::test]
    async fn terminate_assigned_and_queued_processes() {
        let f = fixture().await;
        f.core.dispatch_process(&dispatch("assigned", 0, RestartPolicy::Always)).await.unwrap();
        f.core.dispatch_process(&dispatch("queued", 0, RestartPolicy::Always)).await.unwrap();
        f.core.heartbeat(&heartbeat("r1", 1, vec![])).await.unwrap();
        f.core.tick().await;

        let done = f.core.terminate_process(&Upid::new("assigned")).await.unwrap();
        assert_eq!(done.state, ProcessState::Terminated);
        assert_eq!(f.agents.terminations().len(), 1);
        let r = f.store.get_resource(&ResourceId::new("r1")).await.unwrap().unwrap();
        assert!(r.assigned.is_empty());

        let done = f.core.terminate_process(&Upid::new("queued")).await.unwrap();
        assert_eq!(done.state, ProcessState::Terminated);

        // terminal terminate is a no-op
        let again = f.core.terminate_process(&Upid::new("queued")).await.unwrap();
        assert_eq!(again.state, ProcessState::Terminated);

        assert!(matches!(
            f.core.terminate_process(&Upid::new("ghost")).await,
            Err(PdError::ProcessNotFound(_))
        ));
    }

    #[tokio::test]
    async fn evacuate_node_moves_everything_budget_allows() {
        let f = fixture().await;
        f.core.dispatch_process(&dispatch("a", 0, RestartPolicy::Always)).await.unwrap();
        f.core.dispatch_process(&dispatch("oe", 0, RestartPolicy::OnExitOnly)).await.unwrap();
        f.core.heartbeat(&heartbeat("r1", 4, vec![])).await.unwrap();
        f.core.tick().await;

        f.core.evacuate_node(&InstanceId::new("r1")).await.unwrap();

        let r = f.store.get_resource(&ResourceId::new("r1")).await.unwrap().unwrap();
        assert!(!r.enabled);

        for upid in ["a", "oe"] {
            let p = f.core.describe_process(&Upid::new(upid)).await.unwrap().unwrap();
            assert_eq!(p.round, 1, "{} relocated by evacuation", upid);
        }

        // heartbeats do not resurrect an evacuated resource
        f.core.heartbeat(&heartbeat("r1", 4, vec![])).await.unwrap();
        let r = f.store.get_resource(&ResourceId::new("r1")).await.unwrap().unwrap();
        assert!(!r.enabled);
    }

    #[tokio::test]
    async fn recovery_grace_protects_agents() {
        let f = fixture().await;
        f.core.dispatch_process(&dispatch("p1", 0, RestartPolicy::Always)).await.unwrap();
        f.core.heartbeat(&heartbeat("r1", 4, vec![])).await.unwrap();
        f.core.tick().await;

        // a new doer takes over; the agent looks stale but is inside grace
        f.core.recover().await.unwrap();
        age_resource(&f.store, "r1", 120).await;
        f.core.tick().await;

        let r = f.store.get_resource(&ResourceId::new("r1")).await.unwrap().unwrap();
        assert!(r.enabled, "agents are not expired during the recovery grace window");
        let p = f.core.describe_process(&Upid::new("p1")).await.unwrap().unwrap();
        assert_eq!(p.state, ProcessState::Assigned);
    }

    #[tokio::test]
    async fn slot_accounting_invariant_holds() {
        let f = fixture().await;
        for i in 0..6 {
            f.core
                .dispatch_process(&dispatch(&format!("p{}", i), (i % 3) as u8, RestartPolicy::Always))
                .await
                .unwrap();
        }
        f.core.heartbeat(&heartbeat("r1", 2, vec![])).await.unwrap();
        f.core.heartbeat(&heartbeat("r2", 2, vec![])).await.unwrap();
        f.core.tick().await;

        let assigned: usize = f
            .store
            .resources()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.assigned.len())
            .sum();
        let queued: usize = f
            .store
            .queues_for_engine(&EngineId::new("default"))
            .await
            .unwrap()
            .into_iter()
            .map(|(_, entries)| entries.len())
            .sum();
        let active = f
            .core
            .describe_processes()
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.state.is_active())
            .count();
        assert_eq!(assigned + queued, active);
        assert_eq!(assigned, 4);
        assert_eq!(queued, 2);
    }
}
