//! Deployable-type registry: a passive catalog of DT templates, IaaS sites
//! and per-user site credentials. The provisioner resolves every launch
//! request through [`DtRegistry::lookup`].

pub mod error;
pub mod memory;
pub mod registry;
pub mod service;

pub use error::DtrsError;
pub use memory::MemoryDtrs;
pub use registry::{DtDefinition, DtRegistry, ResolvedDt, SiteMapping};
pub use service::DtrsService;
