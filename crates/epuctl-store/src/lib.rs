pub mod election;
pub mod error;
pub mod memory;
pub mod paths;
pub mod records;
pub mod store;

#[cfg(feature = "coordination")]
pub mod etcd;

pub use election::{Elector, LeaderStatus, LeadershipHandle, MemoryElector, Role};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use records::ControlStore;
pub use store::{StateStore, StoreEvent, StoreEventKind, Version};

#[cfg(feature = "coordination")]
pub use etcd::{EtcdElector, EtcdStore};
