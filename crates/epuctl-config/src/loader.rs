use std::path::Path;
use std::time::Duration;

use epuctl_domain::{EngineId, EngineRegistry, EngineSpec, SiteId};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceType {
    #[default]
    Memory,
    Coordination,
}

impl std::fmt::Display for PersistenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceType::Memory => write!(f, "memory"),
            PersistenceType::Coordination => write!(f, "coordination"),
        }
    }
}

/// Validated control-plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub persistence_type: PersistenceType,
    pub coordination_hosts: Vec<String>,
    pub coordination_path: String,
    pub default_user: String,
    pub heartbeat_timeout: Duration,
    pub agent_timeout: Duration,
    pub tick_interval: Duration,
    pub leader_grace: Duration,
    pub max_restarts: u32,
    pub replica_count: u32,
    pub default_site: Option<SiteId>,
    pub engines: Vec<EngineSpec>,
    pub default_engine: Option<EngineId>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            persistence_type: PersistenceType::Memory,
            coordination_hosts: Vec::new(),
            coordination_path: "/epuctl".to_string(),
            default_user: "default".to_string(),
            heartbeat_timeout: Duration::from_secs(60),
            agent_timeout: Duration::from_secs(60),
            tick_interval: Duration::from_secs(5),
            leader_grace: Duration::from_secs(5),
            max_restarts: 3,
            replica_count: 1,
            default_site: None,
            engines: Vec::new(),
            default_engine: None,
        }
    }
}

impl Config {
    /// Build the engine registry from the configured engine map.
    pub fn engine_registry(&self) -> Result<EngineRegistry, ConfigError> {
        Ok(EngineRegistry::from_specs(
            self.engines.iter().cloned(),
            self.default_engine.clone(),
        )?)
    }
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!("loading config from {}", path.display());
    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::YamlParse { source: e })?;
    convert(raw)
}

fn convert(raw: RawConfig) -> Result<Config, ConfigError> {
    let defaults = Config::default();

    let persistence_type = match raw.persistence_type.as_deref() {
        None | Some("memory") => PersistenceType::Memory,
        Some("coordination") => PersistenceType::Coordination,
        Some(other) => {
            return Err(ConfigError::Invalid(format!(
                "unknown persistence_type '{}', expected 'memory' or 'coordination'",
                other
            )))
        }
    };

    if persistence_type == PersistenceType::Coordination && raw.coordination_hosts.is_empty() {
        return Err(ConfigError::Invalid(
            "persistence_type 'coordination' requires coordination_hosts".to_string(),
        ));
    }

    let replica_count = raw.replica_count.unwrap_or(defaults.replica_count);
    if replica_count < 1 {
        return Err(ConfigError::Invalid("replica_count must be at least 1".to_string()));
    }
    if replica_count > 1 && persistence_type == PersistenceType::Memory {
        return Err(ConfigError::Invalid(
            "replica_count > 1 requires persistence_type 'coordination'".to_string(),
        ));
    }

    let mut engines = Vec::new();
    for (engine_id, raw_engine) in raw.engines {
        let spec = EngineSpec::new(
            EngineId::new(engine_id),
            raw_engine.deployable_type,
            raw_engine.slots,
            raw_engine.replicas.unwrap_or(1),
            raw_engine.spare_slots.unwrap_or(0),
            raw_engine.base_need.unwrap_or(0),
            raw_engine.iaas_allocation,
            raw_engine.maximum_vms,
        )?;
        engines.push(spec);
    }
    // Deterministic registry construction order regardless of YAML map order.
    engines.sort_by(|a, b| a.engine_id.cmp(&b.engine_id));

    let default_engine = raw.default_engine.map(EngineId::new);
    if let Some(default) = &default_engine {
        if !engines.iter().any(|e| &e.engine_id == default) {
            return Err(ConfigError::Invalid(format!(
                "default_engine '{}' is not in the engines map",
                default
            )));
        }
    }

    Ok(Config {
        persistence_type,
        coordination_hosts: raw.coordination_hosts,
        coordination_path: raw
            .coordination_path
            .unwrap_or(defaults.coordination_path),
        default_user: raw.default_user.unwrap_or(defaults.default_user),
        heartbeat_timeout: raw
            .heartbeat_timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_timeout),
        agent_timeout: raw
            .agent_timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.agent_timeout),
        tick_interval: raw
            .tick_interval
            .map(Duration::from_secs)
            .unwrap_or(defaults.tick_interval),
        leader_grace: raw
            .leader_grace
            .map(Duration::from_secs)
            .unwrap_or(defaults.leader_grace),
        max_restarts: raw.max_restarts.unwrap_or(defaults.max_restarts),
        replica_count,
        default_site: raw.default_site.map(SiteId::new),
        engines,
        default_engine,
    })
}
