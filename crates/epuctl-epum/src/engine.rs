use std::collections::HashMap;

use epuctl_domain::{DomainRecord, InstanceId, InstanceRecord};
use serde_json::Value;

use crate::error::EpumError;

/// Observed state a decision engine evaluates on each tick.
pub struct DomainView {
    pub domain: DomainRecord,
    pub instances: Vec<InstanceRecord>,
}

/// What an engine wants done this tick. The doer translates actions into
/// provisioner requests; engines never talk to the IaaS themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Launch { count: u32 },
    Terminate { instance_ids: Vec<InstanceId> },
}

/// Pluggable per-domain policy.
///
/// Implementations are selected by class-name string in the domain config
/// and live in the doer's in-memory cache; they are rebuilt from the stored
/// config on leader change, so any state they keep must be reconstructible.
pub trait DecisionEngine: std::fmt::Debug + Send + 'static {
    fn initialize(&mut self, conf: &Value) -> Result<(), EpumError>;

    fn decide(&mut self, view: &DomainView) -> Vec<Action>;

    fn reconfigure(&mut self, patch: &Value) -> Result<(), EpumError>;
}

type EngineFactory = fn() -> Box<dyn DecisionEngine>;

/// Catalog of known decision engine implementations.
pub struct DecisionEngineRegistry {
    by_name: HashMap<String, EngineFactory>,
}

impl DecisionEngineRegistry {
    pub fn new() -> Self {
        DecisionEngineRegistry { by_name: HashMap::new() }
    }

    /// Registry with the stock engines registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(crate::simplest::ENGINE_NAME, || {
            Box::new(crate::simplest::SimplestEngine::default())
        });
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: EngineFactory) -> &mut Self {
        self.by_name.insert(name.into(), factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Instantiate and initialize the engine selected by `name`.
    pub fn build(&self, name: &str, conf: &Value) -> Result<Box<dyn DecisionEngine>, EpumError> {
        let factory = self
            .by_name
            .get(name)
            .ok_or_else(|| EpumError::UnknownDecisionEngine(name.to_string()))?;
        let mut engine = factory();
        engine.initialize(conf)?;
        Ok(engine)
    }
}

impl Default for DecisionEngineRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
