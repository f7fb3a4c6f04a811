use std::collections::HashMap;

use async_trait::async_trait;
use epuctl_domain::SiteId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DtrsError;

/// Per-site resolution of a deployable type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SiteMapping {
    pub iaas_image: Option<String>,
    pub iaas_allocation: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A templated VM recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DtDefinition {
    #[serde(default)]
    pub mappings: HashMap<SiteId, SiteMapping>,
    pub contextualization: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What the provisioner needs to launch one node of a DT at one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDt {
    pub dt_name: String,
    pub site: SiteId,
    pub iaas_image: Option<String>,
    pub iaas_allocation: Option<String>,
    pub contextualization: Option<Value>,
    /// Template vars passed through the launch request, if any.
    pub vars: Map<String, Value>,
}

#[async_trait]
pub trait DtRegistry: Send + Sync + 'static {
    async fn add_dt(
        &self,
        caller: &str,
        dt_name: &str,
        definition: DtDefinition,
    ) -> Result<(), DtrsError>;

    async fn describe_dt(&self, caller: &str, dt_name: &str) -> Result<DtDefinition, DtrsError>;

    async fn list_dts(&self, caller: &str) -> Result<Vec<String>, DtrsError>;

    async fn remove_dt(&self, caller: &str, dt_name: &str) -> Result<(), DtrsError>;

    async fn add_site(&self, site: &SiteId, definition: Value) -> Result<(), DtrsError>;

    async fn describe_site(&self, site: &SiteId) -> Result<Value, DtrsError>;

    async fn list_sites(&self) -> Result<Vec<SiteId>, DtrsError>;

    async fn add_credentials(
        &self,
        caller: &str,
        site: &SiteId,
        credentials: Value,
    ) -> Result<(), DtrsError>;

    async fn describe_credentials(&self, caller: &str, site: &SiteId)
        -> Result<Value, DtrsError>;

    /// Resolve a DT for a launch at `site`. Fails when the DT is unknown to
    /// the caller, the site is not configured, or the DT carries no mapping
    /// for the site.
    async fn lookup(
        &self,
        caller: &str,
        dt_name: &str,
        site: &SiteId,
        vars: Option<Map<String, Value>>,
    ) -> Result<ResolvedDt, DtrsError>;
}
