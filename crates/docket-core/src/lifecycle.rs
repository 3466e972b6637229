use crate::CoreError;
use serde::Serialize;
use std::fmt;

/// State of the container process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Starting,
    Running,
    Stopping,
    Failed,
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        })
    }
}

pub fn validate_transition(from: ContainerState, to: ContainerState) -> Result<(), CoreError> {
    use ContainerState::{Failed, Running, Starting, Stopped, Stopping};

    let valid = matches!(
        (from, to),
        (Starting, Running | Stopping | Failed)
            | (Running, Stopping | Failed)
            | (Stopping | Failed, Stopped)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// State of one service unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Init,
    Starting,
    Ready,
    Running,
    Restarting,
    /// Oneshot finished successfully, or a longrun exited 0 under `on-failure`.
    Done,
    Skipped,
    Failed,
    Stopping,
    Stopped,
}

impl UnitState {
    /// Dependents may start.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Done)
    }

    /// Dependents will never see this unit become ready.
    pub fn blocks_dependents(self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Failed | Self::Stopping | Self::Stopped
        )
    }

    /// Nothing left to supervise for this unit.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Skipped | Self::Failed | Self::Stopped
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Restarting => "RESTARTING",
            Self::Done => "DONE",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        })
    }
}
