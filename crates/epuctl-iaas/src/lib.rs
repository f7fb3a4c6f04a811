pub mod driver;
pub mod error;
pub mod fake;
pub mod sites;

pub use driver::{
    map_driver_state, DeadlineDriver, DriverNodeState, IaasDriver, IaasNode, NodeSpec,
};
pub use error::IaasError;
pub use fake::FakeIaasDriver;
pub use sites::SiteRegistry;
