use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use epuctl_domain::SiteId;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::DtrsError;
use crate::registry::{DtDefinition, DtRegistry, ResolvedDt};

#[derive(Default)]
struct Inner {
    /// Keyed by (caller, dt_name).
    dts: HashMap<(String, String), DtDefinition>,
    sites: HashMap<SiteId, Value>,
    /// Keyed by (caller, site).
    credentials: HashMap<(String, SiteId), Value>,
}

/// In-memory [`DtRegistry`] for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryDtrs {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryDtrs {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DtRegistry for MemoryDtrs {
    async fn add_dt(
        &self,
        caller: &str,
        dt_name: &str,
        definition: DtDefinition,
    ) -> Result<(), DtrsError> {
        let mut guard = self.inner.write().await;
        guard.dts.insert((caller.to_string(), dt_name.to_string()), definition);
        Ok(())
    }

    async fn describe_dt(&self, caller: &str, dt_name: &str) -> Result<DtDefinition, DtrsError> {
        let guard = self.inner.read().await;
        guard
            .dts
            .get(&(caller.to_string(), dt_name.to_string()))
            .cloned()
            .ok_or_else(|| DtrsError::DtNotFound {
                caller: caller.to_string(),
                dt_name: dt_name.to_string(),
            })
    }

    async fn list_dts(&self, caller: &str) -> Result<Vec<String>, DtrsError> {
        let guard = self.inner.read().await;
        let mut names: Vec<String> = guard
            .dts
            .keys()
            .filter(|(c, _)| c == caller)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove_dt(&self, caller: &str, dt_name: &str) -> Result<(), DtrsError> {
        let mut guard = self.inner.write().await;
        guard
            .dts
            .remove(&(caller.to_string(), dt_name.to_string()))
            .map(|_| ())
            .ok_or_else(|| DtrsError::DtNotFound {
                caller: caller.to_string(),
                dt_name: dt_name.to_string(),
            })
    }

    async fn add_site(&self, site: &SiteId, definition: Value) -> Result<(), DtrsError> {
        let mut guard = self.inner.write().await;
        guard.sites.insert(site.clone(), definition);
        Ok(())
    }

    async fn describe_site(&self, site: &SiteId) -> Result<Value, DtrsError> {
        let guard = self.inner.read().await;
        guard
            .sites
            .get(site)
            .cloned()
            .ok_or_else(|| DtrsError::SiteNotFound(site.to_string()))
    }

    async fn list_sites(&self) -> Result<Vec<SiteId>, DtrsError> {
        let guard = self.inner.read().await;
        let mut sites: Vec<SiteId> = guard.sites.keys().cloned().collect();
        sites.sort();
        Ok(sites)
    }

    async fn add_credentials(
        &self,
        caller: &str,
        site: &SiteId,
        credentials: Value,
    ) -> Result<(), DtrsError> {
        let mut guard = self.inner.write().await;
        guard.credentials.insert((caller.to_string(), site.clone()), credentials);
        Ok(())
    }

    async fn describe_credentials(
        &self,
        caller: &str,
        site: &SiteId,
    ) -> Result<Value, DtrsError> {
        let guard = self.inner.read().await;
        guard
            .credentials
            .get(&(caller.to_string(), site.clone()))
            .cloned()
            .ok_or_else(|| DtrsError::CredentialsNotFound {
                caller: caller.to_string(),
                site: site.to_string(),
            })
    }

    async fn lookup(
        &self,
        caller: &str,
        dt_name: &str,
        site: &SiteId,
        vars: Option<Map<String, Value>>,
    ) -> Result<ResolvedDt, DtrsError> {
        let guard = self.inner.read().await;
        let dt = guard
            .dts
            .get(&(caller.to_string(), dt_name.to_string()))
            .ok_or_else(|| DtrsError::DtNotFound {
                caller: caller.to_string(),
                dt_name: dt_name.to_string(),
            })?;
        if !guard.sites.contains_key(site) {
            return Err(DtrsError::SiteNotFound(site.to_string()));
        }
        let mapping = dt.mappings.get(site).ok_or_else(|| DtrsError::NotMappedForSite {
            dt_name: dt_name.to_string(),
            site: site.to_string(),
        })?;

        Ok(ResolvedDt {
            dt_name: dt_name.to_string(),
            site: site.clone(),
            iaas_image: mapping.iaas_image.clone(),
            iaas_allocation: mapping.iaas_allocation.clone(),
            contextualization: dt.contextualization.clone(),
            vars: vars.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper_dt(site: &str) -> DtDefinition {
        let mut mappings = HashMap::new();
        mappings.insert(
            SiteId::new(site),
            crate::registry::SiteMapping {
                iaas_image: Some("ami-fake".to_string()),
                iaas_allocation: Some("t1.micro".to_string()),
                extra: Map::new(),
            },
        );
        DtDefinition { mappings, contextualization: None, extra: Map::new() }
    }

    #[tokio::test]
    async fn lookup_resolves_site_mapping() {
        let dtrs = MemoryDtrs::new();
        let site = SiteId::new("ec2-fake");
        dtrs.add_dt("default", "sleeper", sleeper_dt("ec2-fake")).await.unwrap();
        dtrs.add_site(&site, serde_json::json!({"driver": "fake"})).await.unwrap();

        let resolved = dtrs.lookup("default", "sleeper", &site, None).await.unwrap();
        assert_eq!(resolved.iaas_image.as_deref(), Some("ami-fake"));
        assert_eq!(resolved.iaas_allocation.as_deref(), Some("t1.micro"));
    }

    #[tokio::test]
    async fn lookup_failures() {
        let dtrs = MemoryDtrs::new();
        let site = SiteId::new("ec2-fake");
        dtrs.add_site(&site, serde_json::json!({})).await.unwrap();

        let err = dtrs.lookup("default", "nonexistent", &site, None).await.unwrap_err();
        assert!(matches!(err, DtrsError::DtNotFound { .. }));

        dtrs.add_dt("default", "sleeper", sleeper_dt("other-site")).await.unwrap();
        let err = dtrs.lookup("default", "sleeper", &site, None).await.unwrap_err();
        assert!(matches!(err, DtrsError::NotMappedForSite { .. }));

        let err = dtrs
            .lookup("default", "sleeper", &SiteId::new("ghost"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DtrsError::SiteNotFound(_)));
    }

    #[tokio::test]
    async fn dts_are_scoped_by_caller() {
        let dtrs = MemoryDtrs::new();
        dtrs.add_dt("alice", "sleeper", sleeper_dt("s")).await.unwrap();

        assert!(dtrs.describe_dt("bob", "sleeper").await.is_err());
        assert_eq!(dtrs.list_dts("alice").await.unwrap(), vec!["sleeper"]);
        assert!(dtrs.list_dts("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn credentials_round_trip() {
        let dtrs = MemoryDtrs::new();
        let site = SiteId::new("ec2-fake");
        let creds = serde_json::json!({"access_key": "xxx", "secret_key": "xxx"});
        dtrs.add_credentials("default", &site, creds.clone()).await.unwrap();

        let got = dtrs.describe_credentials("default", &site).await.unwrap();
        assert_eq!(got, creds);
        assert!(dtrs.describe_credentials("other", &site).await.is_err());
    }
}
