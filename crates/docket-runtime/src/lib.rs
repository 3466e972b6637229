//! Run-time process plumbing for Docket.
//!
//! This crate classifies the calling identity (`Identity`), plans and executes
//! management commands with a one-way privilege drop (`gateway`), launches and
//! signals unit processes behind the `Launcher` trait with a real
//! (`ProcessLauncher`) and a scripted (`ScriptedLauncher`) implementation,
//! runs readiness probes, and performs the first-process handoff to the
//! supervision runtime.

pub mod gateway;
pub mod handoff;
pub mod identity;
pub mod launcher;
pub mod mock;
pub mod probe;

pub use gateway::{account_environment, plan_invocation, CommandPlan, Invocation, EXIT_UNKNOWN_IDENTITY};
pub use handoff::{exit_code_from_wait_status, run_first_process, spawn_and_reap};
pub use identity::{classify, current_identity, Identity, IdentityKind};
pub use launcher::{ExitOutcome, LaunchSpec, Launcher, ProcessLauncher, StopSignal, UnitProcess};
pub use mock::{LaunchRecord, ScriptedLauncher, ScriptedRun, SignalRecord};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("uid {uid} ({name}) is neither root nor the service account; refusing to run management commands")]
    UnknownIdentity { uid: u32, name: String },
    #[error("failed to signal pid {pid}: {message}")]
    Signal { pid: i32, message: String },
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
}
