use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use epuctl_bus::{BusNotifier, EpumClient, InProcessBus, ProvisionerClient};
use epuctl_config::{load_config, Config, PersistenceType};
use epuctl_domain::SiteId;
use epuctl_dtrs::{DtrsService, MemoryDtrs};
use epuctl_epum::{DecisionEngineRegistry, EpuManagement, EpumService};
use epuctl_iaas::{DeadlineDriver, FakeIaasDriver, SiteRegistry};
use epuctl_pd::{BusAgentClient, PdCore, PdService};
use epuctl_provisioner::{ProvisionerCore, ProvisionerService};
use epuctl_store::{ControlStore, Elector, MemoryElector, MemoryStore, StateStore};
use tracing::info;

use crate::cli::RoleArg;

pub fn validate(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    println!("config ok: {}", config_path.display());
    println!("  persistence: {}", config.persistence_type);
    println!("  default user: {}", config.default_user);
    println!("  tick interval: {}s", config.tick_interval.as_secs());
    println!("  engines: {}", config.engines.len());
    for engine in &config.engines {
        println!(
            "    {} (slots {}, base_need {}, spare {})",
            engine.engine_id, engine.slots, engine.base_need, engine.spare_slots
        );
    }
    Ok(())
}

pub async fn run(config_path: PathBuf, roles: Vec<RoleArg>) -> Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let (store, elector): (Arc<dyn StateStore>, Arc<dyn Elector>) =
        build_persistence(&config).await?;
    let control = ControlStore::new(store);

    let bus = Arc::new(InProcessBus::new());
    let notifier = Arc::new(BusNotifier::new(bus.clone()));
    let engine_specs = config.engine_registry()?;

    // DTRS: passive registry, always served in-process.
    let dtrs = Arc::new(MemoryDtrs::new());
    bus.register("dtrs", Arc::new(DtrsService::new(dtrs.clone()))).await;

    // IaaS sites. The built-in driver simulates the IaaS locally; real
    // drivers plug in through the same registry.
    let default_site = config.default_site.clone().unwrap_or_else(|| SiteId::new("local"));
    let mut sites = SiteRegistry::new(default_site.clone());
    sites.register(
        default_site,
        Arc::new(DeadlineDriver::new(
            Arc::new(FakeIaasDriver::new()),
            DeadlineDriver::DEFAULT_DEADLINE,
        )),
    );
    let sites = Arc::new(sites);

    let provisioner_core = Arc::new(ProvisionerCore::new(
        control.clone(),
        notifier.clone(),
        dtrs,
        sites,
        config.default_user.clone(),
    ));
    bus.register("provisioner", Arc::new(ProvisionerService::new(provisioner_core.clone())))
        .await;

    let epum = Arc::new(EpuManagement::new(
        control.clone(),
        ProvisionerClient::new(bus.clone(), "provisioner"),
        notifier.clone(),
        DecisionEngineRegistry::with_defaults(),
        engine_specs.clone(),
        config.default_user.clone(),
        config.heartbeat_timeout,
        "epum",
    ));
    bus.register("epum", Arc::new(EpumService::new(epum.clone()))).await;

    let pd_core = Arc::new(PdCore::new(
        control,
        engine_specs,
        EpumClient::new(bus.clone(), "epum"),
        Arc::new(BusAgentClient::new(bus.clone())),
        notifier,
        config.default_user.clone(),
        config.agent_timeout,
        config.max_restarts,
    ));
    bus.register("pd", Arc::new(PdService::new(pd_core.clone()))).await;

    let mut tasks = Vec::new();
    for role in &roles {
        match role {
            RoleArg::Provisioner => {
                let core = provisioner_core.clone();
                let elector = elector.clone();
                let tick = config.tick_interval;
                tasks.push(tokio::spawn(async move {
                    if let Err(e) =
                        epuctl_provisioner::run_provisioner_doer(core, elector, tick).await
                    {
                        tracing::error!(error = %e, "provisioner doer exited");
                    }
                }));
            }
            RoleArg::Epum => {
                let manager = epum.clone();
                let elector = elector.clone();
                let tick = config.tick_interval;
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = epuctl_epum::run_epum_doer(manager, elector, tick).await {
                        tracing::error!(error = %e, "epum doer exited");
                    }
                }));
            }
            RoleArg::Pd => {
                let core = pd_core.clone();
                let elector = elector.clone();
                let tick = config.tick_interval;
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = epuctl_pd::run_pd_doer(core, elector, tick).await {
                        tracing::error!(error = %e, "pd doer exited");
                    }
                }));
            }
        }
    }

    info!(roles = roles.len(), "control plane running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

#[cfg(feature = "coordination")]
async fn build_persistence(config: &Config) -> Result<(Arc<dyn StateStore>, Arc<dyn Elector>)> {
    match config.persistence_type {
        PersistenceType::Memory => Ok((
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryElector::new()),
        )),
        PersistenceType::Coordination => {
            let store = epuctl_store::EtcdStore::connect(
                &config.coordination_hosts,
                &config.coordination_path,
                config.agent_timeout,
            )
            .await
            .context("connecting to the coordination service")?;
            let elector = epuctl_store::EtcdElector::connect(
                &config.coordination_hosts,
                &config.coordination_path,
                config.leader_grace,
                uuid_hostname(),
            )
            .await
            .context("connecting the elector")?;
            Ok((Arc::new(store), Arc::new(elector)))
        }
    }
}

#[cfg(not(feature = "coordination"))]
async fn build_persistence(config: &Config) -> Result<(Arc<dyn StateStore>, Arc<dyn Elector>)> {
    match config.persistence_type {
        PersistenceType::Memory => Ok((
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryElector::new()),
        )),
        PersistenceType::Coordination => anyhow::bail!(
            "build with the `coordination` feature to use the coordination persistence backend"
        ),
    }
}

#[cfg(feature = "coordination")]
fn uuid_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("replica-{}", std::process::id()))
}
