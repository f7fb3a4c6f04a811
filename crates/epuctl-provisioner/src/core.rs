use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use epuctl_bus::{Notifier, ProvisionRequest};
use epuctl_domain::{
    InstanceId, InstanceRecord, InstanceState, LaunchId, LaunchRecord, SiteId, Subscriber,
};
use epuctl_dtrs::DtRegistry;
use epuctl_iaas::{map_driver_state, IaasError, NodeSpec, SiteRegistry};
use epuctl_store::ControlStore;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::ProvisionerError;

/// How many times a retryable IaaS create is attempted before the node is
/// parked in `ERROR_RETRYING` for a later tick.
const CREATE_ATTEMPTS: u32 = 3;
const CREATE_BACKOFF: Duration = Duration::from_millis(200);

/// A node the driver has never heard of is failed once it has been pending
/// longer than this.
const UNKNOWN_NODE_GRACE: Duration = Duration::from_secs(300);

const EVENT_SOURCE: &str = "provisioner";

enum NodeLaunchFailure {
    /// Retry budget exhausted on a transient error; park in ERROR_RETRYING.
    Transient(String),
    Permanent(String),
}

/// Translates launch requests into IaaS calls and tracks node lifecycles.
///
/// All state lives in the store; this struct is freely cloneable across the
/// doer task and the RPC adapter.
pub struct ProvisionerCore {
    store: ControlStore,
    notifier: Arc<dyn Notifier>,
    dtrs: Arc<dyn DtRegistry>,
    sites: Arc<SiteRegistry>,
    default_user: String,
    /// Set while a terminate-all sweep is draining; gates new launches.
    draining: AtomicBool,
}

impl ProvisionerCore {
    pub fn new(
        store: ControlStore,
        notifier: Arc<dyn Notifier>,
        dtrs: Arc<dyn DtRegistry>,
        sites: Arc<SiteRegistry>,
        default_user: impl Into<String>,
    ) -> Self {
        ProvisionerCore {
            store,
            notifier,
            dtrs,
            sites,
            default_user: default_user.into(),
            draining: AtomicBool::new(false),
        }
    }

    // ── Provision ─────────────────────────────────────────────────────────────

    /// Validate a request and commit launch + node records.
    ///
    /// Well-formed but invalid requests (unknown DT, unknown site) produce
    /// `FAILED` records and notifications rather than errors; the caller
    /// must check the returned launch state before executing. Idempotent on
    /// `launch_id`: a replayed request returns the existing records.
    pub async fn prepare_provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<(LaunchRecord, Vec<InstanceRecord>), ProvisionerError> {
        if request.instance_ids.is_empty() {
            return Err(ProvisionerError::InvalidRequest(
                "instance_ids must be non-empty".to_string(),
            ));
        }
        if request.deployable_type.is_empty() {
            return Err(ProvisionerError::InvalidRequest(
                "deployable_type must be non-empty".to_string(),
            ));
        }

        // At-least-once delivery: a replayed launch_id maps onto the
        // existing records, never a second launch.
        if let Some(existing) = self.store.get_launch(&request.launch_id).await? {
            debug!(launch_id = %request.launch_id, "provision replay, returning existing launch");
            let nodes = self.nodes_by_id(&existing.node_ids).await?;
            return Ok((existing, nodes));
        }

        let caller = request.caller.clone().unwrap_or_else(|| self.default_user.clone());
        let site = self.sites.resolved_site(request.site.as_ref());

        if self.draining.load(Ordering::SeqCst) {
            // the sweep is still draining; record the rejection and bounce
            let desc = Some("TERMINATE_ALL_IN_PROGRESS".to_string());
            let launch = LaunchRecord {
                launch_id: request.launch_id.clone(),
                domain_id: request.domain_id.clone(),
                deployable_type: request.deployable_type.clone(),
                subscribers: request.subscribers.clone(),
                state: InstanceState::Rejected,
                state_desc: desc.clone(),
                node_ids: request.instance_ids.clone(),
                creator: Some(caller),
                extra: Map::new(),
            };
            let nodes: Vec<InstanceRecord> = request
                .instance_ids
                .iter()
                .map(|id| {
                    let mut node = InstanceRecord::new(
                        id.clone(),
                        request.launch_id.clone(),
                        site.clone(),
                        InstanceState::Rejected,
                    );
                    node.state_desc = desc.clone();
                    node
                })
                .collect();
            self.store.create_launch(&launch).await?;
            self.store_and_notify(&nodes, &launch.subscribers).await?;
            return Err(ProvisionerError::Draining);
        }

        // From here on, errors become failure records, not exceptions.
        let mut state = InstanceState::Requested;
        let mut state_desc = None;
        let mut resolved = None;
        match self
            .dtrs
            .lookup(&caller, &request.deployable_type, &site, request.vars.clone())
            .await
        {
            Ok(dt) => resolved = Some(dt),
            Err(e) => {
                error!(
                    deployable_type = %request.deployable_type,
                    error = %e,
                    "deployable type lookup failed"
                );
                state = InstanceState::Failed;
                state_desc = Some(format!("DTRS_LOOKUP_FAILED {}", e));
            }
        }

        let launch = LaunchRecord {
            launch_id: request.launch_id.clone(),
            domain_id: request.domain_id.clone(),
            deployable_type: request.deployable_type.clone(),
            subscribers: request.subscribers.clone(),
            state,
            state_desc: state_desc.clone(),
            node_ids: request.instance_ids.clone(),
            creator: Some(caller.clone()),
            extra: Map::new(),
        };

        let mut nodes = Vec::with_capacity(request.instance_ids.len());
        for instance_id in &request.instance_ids {
            let mut node = InstanceRecord::new(
                instance_id.clone(),
                request.launch_id.clone(),
                site.clone(),
                state,
            );
            node.state_desc = state_desc.clone();
            node.domain_id = request.domain_id.clone();
            node.deployable_type = Some(request.deployable_type.clone());
            node.creator = Some(caller.clone());
            if let Some(dt) = &resolved {
                node.iaas_image = dt.iaas_image.clone();
                node.allocation =
                    request.allocation.clone().or_else(|| dt.iaas_allocation.clone());
            }
            nodes.push(node);
        }

        self.store.create_launch(&launch).await?;
        self.store_and_notify(&nodes, &launch.subscribers).await?;

        Ok((launch, nodes))
    }

    /// Drive a prepared launch toward `STARTED`.
    ///
    /// Node-level problems are folded into the records; an unexpected error
    /// on this path marks the un-launched remainder `FAILED` with a
    /// `PROGRAMMER_ERROR` description and never aborts the caller's tick.
    pub async fn execute_provision(
        &self,
        mut launch: LaunchRecord,
        mut nodes: Vec<InstanceRecord>,
    ) -> Result<(), ProvisionerError> {
        if launch.state >= InstanceState::Started {
            return Ok(());
        }

        if let Err(e) = self.really_execute(&mut launch, &mut nodes).await {
            let desc = match &e {
                ProvisionerError::InvalidRequest(message) => message.clone(),
                other => format!("PROGRAMMER_ERROR {}", other),
            };
            error!(launch_id = %launch.launch_id, error = %e, "launch execution failed");

            launch.state = InstanceState::Failed;
            launch.state_desc = Some(desc.clone());
            for node in nodes.iter_mut() {
                // some nodes may already be up; only mark the rest
                if node.state < InstanceState::Pending {
                    node.state = InstanceState::Failed;
                    node.state_desc = Some(desc.clone());
                }
            }
            self.store.put_launch(&launch).await?;
            self.store_and_notify(&nodes, &launch.subscribers).await?;
        }
        Ok(())
    }

    /// Validate, commit and execute in one step. This is the RPC entry.
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<(), ProvisionerError> {
        let (launch, nodes) = self.prepare_provision(request).await?;
        if launch.state == InstanceState::Failed {
            return Ok(());
        }
        self.execute_provision(launch, nodes).await
    }

    async fn really_execute(
        &self,
        launch: &mut LaunchRecord,
        nodes: &mut [InstanceRecord],
    ) -> Result<(), ProvisionerError> {
        let subscribers = launch.subscribers.clone();
        let mut has_failed = false;
        let mut has_retrying = false;

        for node in nodes.iter_mut() {
            // recovery case: this node made it out in a previous attempt
            if node.state >= InstanceState::Pending {
                debug!(instance_id = %node.instance_id, "skipping already-launched node");
                continue;
            }

            match self.launch_one_node(node).await {
                Ok(observed) => {
                    self.store_and_notify(std::slice::from_ref(node), &subscribers).await?;
                    // the driver may already report the VM up
                    if let Some(next) = observed {
                        if next > node.state && node.state.can_transition(next) {
                            node.state = next;
                            self.store_and_notify(std::slice::from_ref(node), &subscribers)
                                .await?;
                        }
                    }
                }
                Err(NodeLaunchFailure::Transient(desc)) => {
                    warn!(instance_id = %node.instance_id, %desc, "node parked for retry");
                    node.state = InstanceState::ErrorRetrying;
                    node.state_desc = Some(desc);
                    has_retrying = true;
                    self.store_and_notify(std::slice::from_ref(node), &subscribers).await?;
                }
                Err(NodeLaunchFailure::Permanent(desc)) => {
                    warn!(instance_id = %node.instance_id, %desc, "node launch failed");
                    node.state = InstanceState::Failed;
                    node.state_desc = Some(desc);
                    has_failed = true;
                    self.store_and_notify(std::slice::from_ref(node), &subscribers).await?;
                    // no back-out of nodes already launched; stop here and
                    // leave cleanup to terminate
                    break;
                }
            }
        }

        launch.state = if has_failed {
            InstanceState::Failed
        } else if has_retrying {
            // stays REQUESTED so the retry pass picks it up
            InstanceState::Requested
        } else {
            InstanceState::Started
        };
        self.store.put_launch(launch).await?;
        Ok(())
    }

    /// One IaaS create call with a bounded retry for transient errors.
    /// Returns the driver-reported state mapped into the instance machine,
    /// when it is already past `PENDING`.
    async fn launch_one_node(
        &self,
        node: &mut InstanceRecord,
    ) -> Result<Option<InstanceState>, NodeLaunchFailure> {
        let driver = self
            .sites
            .for_site(&node.site)
            .map_err(|e| NodeLaunchFailure::Permanent(format!("SITE_NOT_CONFIGURED {}", e)))?;

        let spec = NodeSpec {
            node_id: node.instance_id.clone(),
            image: node.iaas_image.clone(),
            allocation: node.allocation.clone(),
            context: None,
        };

        let mut delay = CREATE_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match driver.create_node(&spec).await {
                Ok(created) => {
                    node.iaas_id = Some(created.iaas_id.clone());
                    node.public_ip = created.public_ip.clone();
                    node.private_ip = created.private_ip.clone();
                    node.state = InstanceState::Pending;
                    node.state_desc = None;
                    node.pending_timestamp = Some(Utc::now());

                    let mut extra = Map::new();
                    extra.insert("node_id".to_string(), Value::from(node.instance_id.as_str()));
                    extra.insert("iaas_id".to_string(), Value::from(created.iaas_id.clone()));
                    if let Some(ip) = &node.public_ip {
                        extra.insert("public_ip".to_string(), Value::from(ip.clone()));
                    }
                    if let Err(e) = epuctl_events::emit(EVENT_SOURCE, "new_node", extra) {
                        warn!(error = %e, "event emission failed");
                    }

                    let mapped = map_driver_state(created.state);
                    let observed = (mapped > node.state).then_some(mapped);
                    return Ok(observed);
                }
                Err(e) if e.is_retryable() && attempt < CREATE_ATTEMPTS => {
                    debug!(
                        instance_id = %node.instance_id,
                        attempt,
                        error = %e,
                        "transient create failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
                Err(e) if e.is_retryable() => {
                    return Err(NodeLaunchFailure::Transient(format!(
                        "IAAS_RETRY_EXHAUSTED {}",
                        e
                    )))
                }
                Err(e) => return Err(NodeLaunchFailure::Permanent(format!("IAAS_FAILED {}", e))),
            }
        }
    }

    /// Retry pass for nodes parked in `ERROR_RETRYING`: flip them back to
    /// `REQUESTED` and re-execute their launches.
    pub async fn retry_parked_nodes(&self) -> Result<(), ProvisionerError> {
        for launch in self.store.launches_in_state(InstanceState::Requested).await? {
            let mut nodes = self.nodes_by_id(&launch.node_ids).await?;
            let mut any = false;
            for node in nodes.iter_mut() {
                if node.state == InstanceState::ErrorRetrying {
                    node.state = InstanceState::Requested;
                    any = true;
                }
            }
            if any {
                info!(launch_id = %launch.launch_id, "retrying parked nodes");
                self.store.put_nodes(&nodes).await?;
                self.execute_provision(launch, nodes).await?;
            }
        }
        Ok(())
    }

    // ── Query / reconciliation ────────────────────────────────────────────────

    /// Periodic reconciliation against the IaaS view. Never propagates
    /// errors; a failed query is retried on the next tick.
    pub async fn query(&self) {
        if let Err(e) = self.query_nodes().await {
            error!(error = %e, "query pass failed; will retry next tick");
        }
    }

    async fn query_nodes(&self) -> Result<(), ProvisionerError> {
        let nodes = self.store.nodes_at_or_below(InstanceState::Terminating).await?;
        let candidates: Vec<InstanceRecord> = nodes
            .into_iter()
            .filter(|n| n.state >= InstanceState::Pending && n.state < InstanceState::Terminating)
            .collect();
        if !candidates.is_empty() {
            debug!("querying state of {} nodes", candidates.len());
        }

        let mut subscriber_cache: HashMap<LaunchId, Vec<Subscriber>> = HashMap::new();
        for mut node in candidates {
            let driver = match self.sites.for_site(&node.site) {
                Ok(driver) => driver,
                Err(e) => {
                    warn!(site = %node.site, error = %e, "no driver for node site");
                    continue;
                }
            };
            let Some(iaas_id) = node.iaas_id.clone() else { continue };

            let observed = match driver.describe_node(&iaas_id).await {
                Ok(observed) => observed,
                Err(e) => {
                    warn!(%iaas_id, error = %e, "iaas query failed");
                    continue;
                }
            };

            let new_state = match &observed {
                Some(vm) => {
                    let mapped = map_driver_state(vm.state);
                    if mapped == InstanceState::Started && node.state == InstanceState::Started {
                        // stable at the driver: the instance is up
                        Some(InstanceState::Running)
                    } else if mapped > node.state && node.state.can_transition(mapped) {
                        Some(mapped)
                    } else {
                        None
                    }
                }
                None => {
                    let expired = node
                        .pending_timestamp
                        .map(|t| {
                            Utc::now().signed_duration_since(t).num_seconds()
                                > UNKNOWN_NODE_GRACE.as_secs() as i64
                        })
                        .unwrap_or(true);
                    if expired {
                        warn!(%iaas_id, instance_id = %node.instance_id, "node unknown to iaas");
                        node.state_desc = Some("IAAS_NODE_MISSING".to_string());
                        Some(InstanceState::Failed)
                    } else {
                        None
                    }
                }
            };

            let Some(new_state) = new_state else { continue };
            if let Some(vm) = &observed {
                node.public_ip = vm.public_ip.clone().or(node.public_ip.take());
                node.private_ip = vm.private_ip.clone().or(node.private_ip.take());
            }
            node.state = new_state;
            if new_state == InstanceState::Running {
                node.running_timestamp = Some(Utc::now());
                let mut extra = Map::new();
                extra.insert("node_id".to_string(), Value::from(node.instance_id.as_str()));
                extra.insert("iaas_id".to_string(), Value::from(iaas_id));
                if let Some(ip) = &node.public_ip {
                    extra.insert("public_ip".to_string(), Value::from(ip.clone()));
                }
                if let Err(e) = epuctl_events::emit(EVENT_SOURCE, "node_started", extra) {
                    warn!(error = %e, "event emission failed");
                }
            }

            let subscribers = match subscriber_cache.get(&node.launch_id) {
                Some(subscribers) => subscribers.clone(),
                None => {
                    let subscribers = self
                        .store
                        .get_launch(&node.launch_id)
                        .await?
                        .map(|l| l.subscribers)
                        .unwrap_or_default();
                    subscriber_cache.insert(node.launch_id.clone(), subscribers.clone());
                    subscribers
                }
            };
            self.store_and_notify(std::slice::from_ref(&node), &subscribers).await?;
        }
        Ok(())
    }

    // ── Terminate ─────────────────────────────────────────────────────────────

    pub async fn mark_launch_terminating(
        &self,
        launch_id: &LaunchId,
    ) -> Result<(), ProvisionerError> {
        let Some(mut launch) = self.store.get_launch(launch_id).await? else {
            return Err(ProvisionerError::UnknownNode(launch_id.to_string()));
        };
        let mut nodes = self.nodes_by_id(&launch.node_ids).await?;
        let mut updated = Vec::new();
        for node in nodes.iter_mut() {
            if node.state < InstanceState::Terminating {
                node.state = InstanceState::Terminating;
                updated.push(node.clone());
            }
        }
        if !updated.is_empty() {
            self.store_and_notify(&updated, &launch.subscribers).await?;
        }
        launch.state = InstanceState::Terminating;
        self.store.put_launch(&launch).await?;
        Ok(())
    }

    pub async fn terminate_launch(&self, launch_id: &LaunchId) -> Result<(), ProvisionerError> {
        let Some(launch) = self.store.get_launch(launch_id).await? else {
            return Err(ProvisionerError::UnknownNode(launch_id.to_string()));
        };
        let mut nodes = self.nodes_by_id(&launch.node_ids).await?;

        for node in nodes.iter_mut() {
            if node.state >= InstanceState::Terminated {
                continue;
            }
            self.terminate_one_node(node, &launch.subscribers).await?;
        }

        let mut launch = launch;
        launch.state = InstanceState::Terminated;
        self.store.put_launch(&launch).await?;
        Ok(())
    }

    pub async fn terminate_launches(&self, launch_ids: &[LaunchId]) -> Result<(), ProvisionerError> {
        for launch_id in launch_ids {
            self.mark_launch_terminating(launch_id).await?;
            self.terminate_launch(launch_id).await?;
        }
        Ok(())
    }

    pub async fn mark_nodes_terminating(
        &self,
        node_ids: &[InstanceId],
    ) -> Result<(), ProvisionerError> {
        debug!(?node_ids, "marking nodes for termination");
        let nodes = self.nodes_by_id(node_ids).await?;

        let mut by_launch: HashMap<LaunchId, Vec<InstanceRecord>> = HashMap::new();
        for node in nodes {
            by_launch.entry(node.launch_id.clone()).or_default().push(node);
        }

        for (launch_id, mut launch_nodes) in by_launch {
            let Some(launch) = self.store.get_launch(&launch_id).await? else {
                warn!(%launch_id, "failed to find launch record");
                continue;
            };
            for node in launch_nodes.iter_mut() {
                if node.state < InstanceState::Terminating {
                    node.state = InstanceState::Terminating;
                }
            }
            self.store_and_notify(&launch_nodes, &launch.subscribers).await?;
        }
        Ok(())
    }

    pub async fn terminate_nodes(&self, node_ids: &[InstanceId]) -> Result<(), ProvisionerError> {
        for node_id in node_ids {
            let Some(mut node) = self.store.get_node(node_id).await? else {
                warn!(%node_id, "node unknown but requested for termination");
                continue;
            };
            if node.state >= InstanceState::Terminated {
                continue;
            }
            info!(%node_id, "terminating node");
            let subscribers = self
                .store
                .get_launch(&node.launch_id)
                .await?
                .map(|l| l.subscribers)
                .unwrap_or_default();
            self.terminate_one_node(&mut node, &subscribers).await?;
        }
        Ok(())
    }

    async fn terminate_one_node(
        &self,
        node: &mut InstanceRecord,
        subscribers: &[Subscriber],
    ) -> Result<(), ProvisionerError> {
        // nodes that never reached the IaaS have nothing to destroy
        if node.state >= InstanceState::Pending {
            if let Some(iaas_id) = node.iaas_id.clone() {
                let driver = match self.sites.for_site(&node.site) {
                    Ok(driver) => driver,
                    Err(e) => {
                        warn!(site = %node.site, error = %e, "no driver for node site");
                        return Ok(());
                    }
                };
                match driver.destroy_node(&iaas_id).await {
                    Ok(()) => {}
                    Err(IaasError::NotFound(_)) => {}
                    Err(e) => {
                        // leave the record TERMINATING; the next pass retries
                        warn!(%iaas_id, error = %e, "destroy failed, will retry");
                        if node.state < InstanceState::Terminating {
                            node.state = InstanceState::Terminating;
                            self.store_and_notify(std::slice::from_ref(node), subscribers)
                                .await?;
                        }
                        return Ok(());
                    }
                }
            }
        }
        node.state = InstanceState::Terminated;
        node.terminated_timestamp = Some(Utc::now());
        self.store_and_notify(std::slice::from_ref(node), subscribers).await?;
        Ok(())
    }

    /// Bulk sweep: terminate every launch that is not already terminal.
    /// While the sweep is incomplete, new provision requests are rejected.
    pub async fn terminate_all(&self) -> Result<bool, ProvisionerError> {
        self.draining.store(true, Ordering::SeqCst);
        let launches = self.store.launches_at_or_below(InstanceState::Terminating).await?;
        for launch in launches {
            warn!(launch_id = %launch.launch_id, "terminate-all");
            self.mark_launch_terminating(&launch.launch_id).await?;
            self.terminate_launch(&launch.launch_id).await?;
        }
        let complete = self.check_terminate_all().await?;
        if complete {
            self.draining.store(false, Ordering::SeqCst);
        }
        Ok(complete)
    }

    /// True when no launches below the terminal band remain.
    pub async fn check_terminate_all(&self) -> Result<bool, ProvisionerError> {
        let remaining = self.store.launches_at_or_below(InstanceState::Terminating).await?;
        Ok(remaining.is_empty())
    }

    // ── Describe / dump ───────────────────────────────────────────────────────

    pub async fn describe_nodes(
        &self,
        node_ids: Option<&[InstanceId]>,
    ) -> Result<Vec<InstanceRecord>, ProvisionerError> {
        match node_ids {
            None => Ok(self.store.nodes().await?),
            Some(ids) => Ok(self.nodes_by_id(ids).await?),
        }
    }

    /// Re-send node state to subscribers. An unknown node with a
    /// `force_subscribe` recipient gets a synthesised `FAILED` record so
    /// the recipient is not left waiting forever.
    pub async fn dump_state(
        &self,
        node_ids: &[InstanceId],
        force_subscribe: Option<&Subscriber>,
    ) -> Result<(), ProvisionerError> {
        for node_id in node_ids {
            match self.store.get_node(node_id).await? {
                Some(node) => {
                    let mut subscribers = self
                        .store
                        .get_launch(&node.launch_id)
                        .await?
                        .map(|l| l.subscribers)
                        .unwrap_or_default();
                    if let Some(extra) = force_subscribe {
                        if !subscribers.contains(extra) {
                            subscribers.push(extra.clone());
                        }
                    }
                    self.notifier
                        .send_record(serde_json::to_value(&node).map_err(
                            epuctl_store::StoreError::from,
                        )?, &subscribers)
                        .await;
                }
                None => {
                    let Some(extra) = force_subscribe else { continue };
                    warn!(
                        %node_id,
                        subscriber = %extra,
                        "dump_state for unknown node, notifying failure"
                    );
                    let record = serde_json::json!({
                        "instance_id": node_id,
                        "state": InstanceState::Failed,
                    });
                    self.notifier.send_record(record, std::slice::from_ref(extra)).await;
                }
            }
        }
        Ok(())
    }

    // ── Recovery ──────────────────────────────────────────────────────────────

    /// Finish any incomplete launches or terminations. Run on boot and on
    /// leader acquisition, before taking new work.
    pub async fn recover(&self) -> Result<(), ProvisionerError> {
        for launch in self.store.launches_in_state(InstanceState::Requested).await? {
            info!(launch_id = %launch.launch_id, "recovering incomplete launch");
            let nodes = self.nodes_by_id(&launch.node_ids).await?;
            self.execute_provision(launch, nodes).await?;
        }

        for launch in self.store.launches_in_state(InstanceState::Terminating).await? {
            info!(launch_id = %launch.launch_id, "recovering incomplete launch termination");
            self.terminate_launch(&launch.launch_id).await?;
        }

        self.resume_node_terminations().await?;
        Ok(())
    }

    /// Re-drive nodes stuck in `TERMINATING` (e.g. after a destroy failure).
    pub async fn resume_node_terminations(&self) -> Result<(), ProvisionerError> {
        let terminating = self.store.nodes_in_state(InstanceState::Terminating).await?;
        if !terminating.is_empty() {
            let node_ids: Vec<InstanceId> =
                terminating.iter().map(|n| n.instance_id.clone()).collect();
            info!(?node_ids, "resuming incomplete node terminations");
            self.terminate_nodes(&node_ids).await?;
        }
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn nodes_by_id(
        &self,
        node_ids: &[InstanceId],
    ) -> Result<Vec<InstanceRecord>, ProvisionerError> {
        let mut nodes = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            if let Some(node) = self.store.get_node(node_id).await? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    async fn store_and_notify(
        &self,
        records: &[InstanceRecord],
        subscribers: &[Subscriber],
    ) -> Result<(), ProvisionerError> {
        self.store.put_nodes(records).await?;
        let values: Vec<Value> = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()
            .map_err(epuctl_store::StoreError::from)?;
        self.notifier.send_records(&values, subscribers).await;
        Ok(())
    }
}
