use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::error::StoreError;

/// The control-plane roles that elect a doer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    EpumDoer,
    PdDoer,
    ProvisionerDoer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::EpumDoer => "epum_doer",
            Role::PdDoer => "pd_doer",
            Role::ProvisionerDoer => "provisioner_doer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderStatus {
    Leader,
    Standby,
}

/// Membership in an election. Dropping the handle resigns, which lets a
/// standby replica take over.
pub struct LeadershipHandle {
    role: Role,
    rx: watch::Receiver<LeaderStatus>,
    resign: Option<Box<dyn FnOnce() + Send>>,
}

impl LeadershipHandle {
    /// Assemble a handle from a status channel and a resign hook. Elector
    /// implementations use this; callers go through [`Elector::join`].
    pub fn from_parts(
        role: Role,
        rx: watch::Receiver<LeaderStatus>,
        resign: Box<dyn FnOnce() + Send>,
    ) -> Self {
        LeadershipHandle { role, rx, resign: Some(resign) }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> LeaderStatus {
        *self.rx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.status() == LeaderStatus::Leader
    }

    /// A watch channel yielding leadership changes. Doer loops must check
    /// this at every suspension point and stop writing within the grace
    /// period after losing leadership.
    pub fn subscribe(&self) -> watch::Receiver<LeaderStatus> {
        self.rx.clone()
    }

    pub fn resign(mut self) {
        if let Some(resign) = self.resign.take() {
            resign();
        }
    }
}

impl Drop for LeadershipHandle {
    fn drop(&mut self) {
        if let Some(resign) = self.resign.take() {
            resign();
        }
    }
}

/// Elects one doer per role among replicas.
#[async_trait]
pub trait Elector: Send + Sync + 'static {
    async fn join(&self, role: Role) -> Result<LeadershipHandle, StoreError>;
}

struct Candidate {
    id: u64,
    tx: watch::Sender<LeaderStatus>,
}

#[derive(Default)]
struct ElectorInner {
    next_id: u64,
    candidates: HashMap<Role, Vec<Candidate>>,
}

/// Single-process election: the earliest joiner per role leads, later
/// joiners queue in join order and are promoted on resignation — the same
/// lowest-sequence-wins discipline the coordination backend provides with
/// ephemeral sequential nodes.
#[derive(Clone, Default)]
pub struct MemoryElector {
    inner: Arc<Mutex<ElectorInner>>,
}

impl MemoryElector {
    pub fn new() -> Self {
        Self::default()
    }

    fn leave(inner: &Arc<Mutex<ElectorInner>>, role: Role, id: u64) {
        let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = guard.candidates.get_mut(&role) else { return };
        let Some(position) = queue.iter().position(|c| c.id == id) else { return };
        let was_leader = position == 0;
        queue.remove(position);
        if was_leader {
            if let Some(next) = queue.first() {
                debug!(role = %role, "promoting standby to leader");
                let _ = next.tx.send(LeaderStatus::Leader);
            }
        }
    }
}

#[async_trait]
impl Elector for MemoryElector {
    async fn join(&self, role: Role) -> Result<LeadershipHandle, StoreError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.next_id += 1;
        let id = guard.next_id;

        let queue = guard.candidates.entry(role).or_default();
        let status = if queue.is_empty() { LeaderStatus::Leader } else { LeaderStatus::Standby };
        let (tx, rx) = watch::channel(status);
        queue.push(Candidate { id, tx });
        drop(guard);

        let inner = self.inner.clone();
        Ok(LeadershipHandle {
            role,
            rx,
            resign: Some(Box::new(move || MemoryElector::leave(&inner, role, id))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_joiner_leads() {
        let elector = MemoryElector::new();
        let first = elector.join(Role::EpumDoer).await.unwrap();
        let second = elector.join(Role::EpumDoer).await.unwrap();

        assert!(first.is_leader());
        assert!(!second.is_leader());
    }

    #[tokio::test]
    async fn roles_are_independent() {
        let elector = MemoryElector::new();
        let epum = elector.join(Role::EpumDoer).await.unwrap();
        let pd = elector.join(Role::PdDoer).await.unwrap();
        assert!(epum.is_leader());
        assert!(pd.is_leader());
    }

    #[tokio::test]
    async fn standby_promoted_on_resign() {
        let elector = MemoryElector::new();
        let first = elector.join(Role::PdDoer).await.unwrap();
        let second = elector.join(Role::PdDoer).await.unwrap();
        let mut watch = second.subscribe();

        first.resign();
        watch.changed().await.unwrap();
        assert!(second.is_leader());
    }

    #[tokio::test]
    async fn dropping_the_leader_promotes_too() {
        let elector = MemoryElector::new();
        let first = elector.join(Role::ProvisionerDoer).await.unwrap();
        let second = elector.join(Role::ProvisionerDoer).await.unwrap();

        drop(first);
        assert!(second.is_leader());
    }

    #[tokio::test]
    async fn resigning_a_standby_does_not_disturb_the_leader() {
        let elector = MemoryElector::new();
        let first = elector.join(Role::EpumDoer).await.unwrap();
        let second = elector.join(Role::EpumDoer).await.unwrap();
        let third = elector.join(Role::EpumDoer).await.unwrap();

        second.resign();
        assert!(first.is_leader());
        assert!(!third.is_leader());
    }
}
