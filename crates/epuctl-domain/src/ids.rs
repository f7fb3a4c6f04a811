use serde::{Deserialize, Serialize};

/// Declares a newtype over `String` with the usual id plumbing.
macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                $name(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Autoscale group identifier. PD-owned domains use the `pd_domain_<engine>` pattern.
    DomainId
);
string_id!(
    /// Identifies a group of instances provisioned together.
    LaunchId
);
string_id!(
    /// One VM tracked by the provisioner.
    InstanceId
);
string_id!(
    /// Engine (resource template) identifier from static config.
    EngineId
);
string_id!(
    /// Universal process id, globally unique.
    Upid
);
string_id!(
    /// One EEAgent's advertised slot pool. Equal to the node id of the VM running it.
    ResourceId
);
string_id!(
    /// IaaS site name, resolved through the site registry.
    SiteId
);

impl Upid {
    pub fn generate() -> Self {
        Upid(uuid::Uuid::new_v4().to_string())
    }
}

impl InstanceId {
    pub fn generate() -> Self {
        InstanceId(uuid::Uuid::new_v4().to_string())
    }
}

impl LaunchId {
    pub fn generate() -> Self {
        LaunchId(uuid::Uuid::new_v4().to_string())
    }
}
