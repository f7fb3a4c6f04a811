use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle state of a provisioned instance.
///
/// The wire form is `"<code>-<NAME>"` (e.g. `"600-RUNNING"`) and is stable.
/// Transitions must be monotonic in code order, with one documented
/// exception: `ERROR_RETRYING → REQUESTED` when a transient failure is
/// retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstanceState {
    #[serde(rename = "100-REQUESTING")]
    Requesting,
    #[serde(rename = "200-REQUESTED")]
    Requested,
    #[serde(rename = "300-ERROR_RETRYING")]
    ErrorRetrying,
    #[serde(rename = "400-PENDING")]
    Pending,
    #[serde(rename = "500-STARTED")]
    Started,
    #[serde(rename = "600-RUNNING")]
    Running,
    #[serde(rename = "700-TERMINATING")]
    Terminating,
    #[serde(rename = "800-TERMINATED")]
    Terminated,
    #[serde(rename = "850-FAILED")]
    Failed,
    #[serde(rename = "900-REJECTED")]
    Rejected,
}

impl InstanceState {
    pub fn code(&self) -> u16 {
        match self {
            InstanceState::Requesting => 100,
            InstanceState::Requested => 200,
            InstanceState::ErrorRetrying => 300,
            InstanceState::Pending => 400,
            InstanceState::Started => 500,
            InstanceState::Running => 600,
            InstanceState::Terminating => 700,
            InstanceState::Terminated => 800,
            InstanceState::Failed => 850,
            InstanceState::Rejected => 900,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstanceState::Requesting => "REQUESTING",
            InstanceState::Requested => "REQUESTED",
            InstanceState::ErrorRetrying => "ERROR_RETRYING",
            InstanceState::Pending => "PENDING",
            InstanceState::Started => "STARTED",
            InstanceState::Running => "RUNNING",
            InstanceState::Terminating => "TERMINATING",
            InstanceState::Terminated => "TERMINATED",
            InstanceState::Failed => "FAILED",
            InstanceState::Rejected => "REJECTED",
        }
    }

    /// No further transitions are expected out of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Terminated | InstanceState::Failed | InstanceState::Rejected
        )
    }

    /// Whether a transition `self → to` respects the ordered state machine.
    /// Re-asserting the current state is always allowed.
    pub fn can_transition(&self, to: InstanceState) -> bool {
        if *self == InstanceState::ErrorRetrying && to == InstanceState::Requested {
            return true;
        }
        to.code() >= self.code()
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.code(), self.name())
    }
}

impl std::str::FromStr for InstanceState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            InstanceState::Requesting,
            InstanceState::Requested,
            InstanceState::ErrorRetrying,
            InstanceState::Pending,
            InstanceState::Started,
            InstanceState::Running,
            InstanceState::Terminating,
            InstanceState::Terminated,
            InstanceState::Failed,
            InstanceState::Rejected,
        ];
        all.into_iter()
            .find(|state| state.to_string() == s)
            .ok_or_else(|| DomainError::UnknownState(s.to_string()))
    }
}

/// Lifecycle state of a dispatched process.
///
/// Same wire encoding scheme as [`InstanceState`]. A process requeued for
/// restart goes back to `REQUESTED` with its round incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProcessState {
    #[serde(rename = "100-UNSCHEDULED")]
    Unscheduled,
    #[serde(rename = "200-REQUESTED")]
    Requested,
    #[serde(rename = "300-WAITING")]
    Waiting,
    #[serde(rename = "400-ASSIGNED")]
    Assigned,
    #[serde(rename = "500-RUNNING")]
    Running,
    #[serde(rename = "600-EXITED")]
    Exited,
    #[serde(rename = "700-TERMINATING")]
    Terminating,
    #[serde(rename = "800-TERMINATED")]
    Terminated,
    #[serde(rename = "850-FAILED")]
    Failed,
    #[serde(rename = "900-REJECTED")]
    Rejected,
}

impl ProcessState {
    pub fn code(&self) -> u16 {
        match self {
            ProcessState::Unscheduled => 100,
            ProcessState::Requested => 200,
            ProcessState::Waiting => 300,
            ProcessState::Assigned => 400,
            ProcessState::Running => 500,
            ProcessState::Exited => 600,
            ProcessState::Terminating => 700,
            ProcessState::Terminated => 800,
            ProcessState::Failed => 850,
            ProcessState::Rejected => 900,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcessState::Unscheduled => "UNSCHEDULED",
            ProcessState::Requested => "REQUESTED",
            ProcessState::Waiting => "WAITING",
            ProcessState::Assigned => "ASSIGNED",
            ProcessState::Running => "RUNNING",
            ProcessState::Exited => "EXITED",
            ProcessState::Terminating => "TERMINATING",
            ProcessState::Terminated => "TERMINATED",
            ProcessState::Failed => "FAILED",
            ProcessState::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Exited
                | ProcessState::Terminated
                | ProcessState::Failed
                | ProcessState::Rejected
        )
    }

    /// States that occupy a slot or a queue position.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessState::Requested
                | ProcessState::Waiting
                | ProcessState::Assigned
                | ProcessState::Running
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.code(), self.name())
    }
}
