use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::ids::{DomainId, EngineId};

/// Domain ids owned by the process dispatcher follow this pattern.
pub const DOMAIN_PREFIX: &str = "pd_domain_";

/// Extract the engine id from a `pd_domain_<engine>` domain id.
pub fn engine_id_from_domain(domain_id: &DomainId) -> Result<EngineId, DomainError> {
    let suffix = domain_id
        .as_str()
        .strip_prefix(DOMAIN_PREFIX)
        .ok_or_else(|| DomainError::InvalidDomainId(domain_id.to_string()))?;
    if suffix.is_empty() {
        return Err(DomainError::InvalidDomainId(domain_id.to_string()));
    }
    Ok(EngineId::new(suffix))
}

/// Build the `pd_domain_<engine>` domain id for an engine.
pub fn domain_id_from_engine(engine_id: &EngineId) -> Result<DomainId, DomainError> {
    if engine_id.as_str().is_empty() {
        return Err(DomainError::InvalidEngineId(engine_id.to_string()));
    }
    Ok(DomainId::new(format!("{}{}", DOMAIN_PREFIX, engine_id)))
}

/// Static resource template for one engine type: how many process slots a
/// VM of this kind advertises and how the autoscale need is shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub engine_id: EngineId,
    /// Deployable type launched for this engine.
    pub deployable_type: String,
    pub slots: u32,
    pub replicas: u32,
    pub spare_slots: u32,
    pub base_need: u32,
    pub iaas_allocation: Option<String>,
    pub maximum_vms: Option<u32>,
}

impl EngineSpec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine_id: EngineId,
        deployable_type: impl Into<String>,
        slots: u32,
        replicas: u32,
        spare_slots: u32,
        base_need: u32,
        iaas_allocation: Option<String>,
        maximum_vms: Option<u32>,
    ) -> Result<Self, DomainError> {
        if slots < 1 {
            return Err(DomainError::InvalidEngineSpec {
                engine_id: engine_id.to_string(),
                message: "slots must be a positive integer".to_string(),
            });
        }
        if replicas < 1 {
            return Err(DomainError::InvalidEngineSpec {
                engine_id: engine_id.to_string(),
                message: "replicas must be a positive integer".to_string(),
            });
        }
        Ok(EngineSpec {
            engine_id,
            deployable_type: deployable_type.into(),
            slots,
            replicas,
            spare_slots,
            base_need,
            iaas_allocation,
            maximum_vms,
        })
    }
}

/// Static catalog of engine types, loaded at boot.
///
/// Unknown engine ids resolve to the default engine when one is declared.
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    default: Option<EngineId>,
    by_engine: HashMap<EngineId, EngineSpec>,
}

impl EngineRegistry {
    pub fn new(default: Option<EngineId>) -> Self {
        EngineRegistry { default, by_engine: HashMap::new() }
    }

    pub fn from_specs(
        specs: impl IntoIterator<Item = EngineSpec>,
        default: Option<EngineId>,
    ) -> Result<Self, DomainError> {
        let mut registry = EngineRegistry::new(default);
        for spec in specs {
            registry.add(spec)?;
        }
        if let Some(default) = &registry.default {
            if !registry.by_engine.contains_key(default) {
                return Err(DomainError::EngineUnknown(default.to_string()));
            }
        }
        Ok(registry)
    }

    pub fn add(&mut self, spec: EngineSpec) -> Result<(), DomainError> {
        if self.by_engine.contains_key(&spec.engine_id) {
            return Err(DomainError::DuplicateEngine(spec.engine_id.to_string()));
        }
        self.by_engine.insert(spec.engine_id.clone(), spec);
        Ok(())
    }

    /// Resolve an engine id, falling back to the default engine when the id
    /// is unknown and a default is declared.
    pub fn get(&self, engine_id: &EngineId) -> Result<&EngineSpec, DomainError> {
        if let Some(spec) = self.by_engine.get(engine_id) {
            return Ok(spec);
        }
        self.default
            .as_ref()
            .and_then(|d| self.by_engine.get(d))
            .ok_or_else(|| DomainError::EngineUnknown(engine_id.to_string()))
    }

    /// Strict lookup with no default fallback.
    pub fn get_exact(&self, engine_id: &EngineId) -> Option<&EngineSpec> {
        self.by_engine.get(engine_id)
    }

    pub fn default_engine(&self) -> Option<&EngineId> {
        self.default.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineSpec> {
        self.by_engine.values()
    }

    pub fn len(&self) -> usize {
        self.by_engine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_engine.is_empty()
    }
}
