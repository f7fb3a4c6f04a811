use std::collections::HashMap;
use std::sync::Arc;

use epuctl_domain::SiteId;

use crate::driver::IaasDriver;
use crate::error::IaasError;

/// Dispatches IaaS calls to the driver registered for a site.
///
/// A launch request names its site; requests without one use
/// `default_site`.
pub struct SiteRegistry {
    pub default_site: SiteId,
    drivers: HashMap<SiteId, Arc<dyn IaasDriver>>,
}

impl SiteRegistry {
    pub fn new(default_site: SiteId) -> Self {
        SiteRegistry { default_site, drivers: HashMap::new() }
    }

    pub fn register(&mut self, site: SiteId, driver: Arc<dyn IaasDriver>) -> &mut Self {
        self.drivers.insert(site, driver);
        self
    }

    pub fn for_site(&self, site: &SiteId) -> Result<Arc<dyn IaasDriver>, IaasError> {
        self.drivers
            .get(site)
            .cloned()
            .ok_or_else(|| IaasError::SiteNotConfigured(site.to_string()))
    }

    pub fn resolved_site(&self, site: Option<&SiteId>) -> SiteId {
        site.cloned().unwrap_or_else(|| self.default_site.clone())
    }

    pub fn active_sites(&self) -> Vec<SiteId> {
        self.drivers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeIaasDriver;

    #[test]
    fn resolves_registered_and_default_sites() {
        let mut registry = SiteRegistry::new(SiteId::new("fake"));
        registry.register(SiteId::new("fake"), Arc::new(FakeIaasDriver::new()));

        assert!(registry.for_site(&SiteId::new("fake")).is_ok());
        assert!(matches!(
            registry.for_site(&SiteId::new("ec2-west")),
            Err(IaasError::SiteNotConfigured(_))
        ));
        assert_eq!(registry.resolved_site(None).as_str(), "fake");
        assert_eq!(
            registry.resolved_site(Some(&SiteId::new("other"))).as_str(),
            "other"
        );
    }
}
