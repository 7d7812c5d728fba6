//! Exec lifecycle status and state machine.
//!
//! Defines the possible states of an exec and the valid transitions
//! between them.

use hcslite_shared::{HcsliteError, HcsliteResult, TaskStatus};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an exec.
///
/// The state graph is a straight line with one shortcut:
/// ```text
/// create() → Created
/// start()  → Running
/// (exit)   → Exited
/// ```
/// plus `Created → Exited` when a terminal signal lands before start.
/// States are never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    /// Exec is registered but its process has not been started.
    Created,

    /// The backend process is running.
    Running,

    /// The process has exited and the exit latch is set.
    Exited,
}

impl ExecStatus {
    pub fn is_created(&self) -> bool {
        matches!(self, ExecStatus::Created)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ExecStatus::Running)
    }

    pub fn is_exited(&self) -> bool {
        matches!(self, ExecStatus::Exited)
    }

    /// Check if start() can be called from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, ExecStatus::Created)
    }

    /// Check if the exec still counts as live for kill broadcasts.
    pub fn is_live(&self) -> bool {
        matches!(self, ExecStatus::Created | ExecStatus::Running)
    }

    /// Check if delete() can be called from this state.
    pub fn can_delete(&self) -> bool {
        matches!(self, ExecStatus::Exited)
    }

    /// Check if a console resize is possible in this state.
    pub fn can_resize(&self) -> bool {
        matches!(self, ExecStatus::Running)
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: ExecStatus) -> bool {
        use ExecStatus::*;
        matches!(
            (self, target),
            // Created → Running (start) or Exited (early terminal signal)
            (Created, Running) | (Created, Exited) |
            // Running → Exited (process exit)
            (Running, Exited)
        )
    }

    /// Convert to string for logs and snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Created => "created",
            ExecStatus::Running => "running",
            ExecStatus::Exited => "exited",
        }
    }
}

impl From<ExecStatus> for TaskStatus {
    fn from(status: ExecStatus) -> Self {
        match status {
            ExecStatus::Created => TaskStatus::Created,
            ExecStatus::Running => TaskStatus::Running,
            ExecStatus::Exited => TaskStatus::Stopped,
        }
    }
}

impl std::str::FromStr for ExecStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ExecStatus::Created),
            "running" => Ok(ExecStatus::Running),
            "exited" => Ok(ExecStatus::Exited),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validated state holder used inside an exec.
#[derive(Debug, Clone, Copy)]
pub struct ExecState {
    status: ExecStatus,
}

impl ExecState {
    pub fn new() -> Self {
        Self {
            status: ExecStatus::Created,
        }
    }

    pub fn status(&self) -> ExecStatus {
        self.status
    }

    /// Attempt a state transition with validation.
    pub fn transition_to(&mut self, target: ExecStatus) -> HcsliteResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(HcsliteError::FailedPrecondition(format!(
                "cannot transition from {} to {}",
                self.status, target
            )));
        }
        self.status = target;
        Ok(())
    }
}

impl Default for ExecState {
    fn default() -> Self {
        Self::new()
    }
}
