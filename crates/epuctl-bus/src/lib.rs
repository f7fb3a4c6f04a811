//! Message-bus abstraction and the client surface built on it.
//!
//! The wire transport is out of scope for the control plane; everything
//! here is expressed against the [`MessageBus`] trait. The in-process bus
//! serves tests and single-process deployments, and the typed clients wrap
//! bus calls so callers never touch raw payloads.

pub mod bus;
pub mod clients;
pub mod error;
pub mod inprocess;
pub mod messages;
pub mod notifier;

pub use bus::{BusHandler, MessageBus};
pub use clients::{DtrsClient, EpumClient, PdClient, ProvisionerClient};
pub use error::BusError;
pub use inprocess::InProcessBus;
pub use messages::{
    AgentHeartbeat, AgentProcess, AgentProcessStatus, DispatchRequest, ProvisionRequest,
};
pub use notifier::{BusNotifier, Notifier, RecordingNotifier};
