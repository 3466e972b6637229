//! Core orchestration for Docket.
//!
//! This crate ties the schema, fetch and runtime layers together: the build
//! `Engine` (resolve, verify, install, overlay, image preparation, build record),
//! the build lock and interruption flag, the unit dependency graph, restart
//! accounting, the container lifecycle state machine and the `Supervisor` that
//! runs service units.

pub mod concurrency;
pub mod engine;
pub mod graph;
pub mod lifecycle;
pub mod record;
pub mod restart;
pub mod supervisor;

pub use concurrency::{install_signal_handler, shutdown_requested, BuildLock};
pub use engine::{BuildOptions, BuildResult, Engine};
pub use graph::UnitGraph;
pub use lifecycle::{validate_transition, ContainerState, UnitState};
pub use record::{BuildRecord, RecordedArtifact, BUILD_RECORD_FILE};
pub use restart::RestartManager;
pub use supervisor::{
    FatalCondition, RunAs, SupervisionReport, Supervisor, UnitSummary, UnitTransition,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] docket_schema::ManifestError),
    #[error("unit error: {0}")]
    Unit(#[from] docket_schema::UnitError),
    #[error("architecture error: {0}")]
    Arch(#[from] docket_schema::ArchError),
    #[error("{0}")]
    Fetch(#[from] docket_fetch::FetchError),
    #[error("runtime error: {0}")]
    Runtime(#[from] docket_runtime::RuntimeError),
    #[error("dependency cycle between units: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("another build holds the lock at {0}")]
    Locked(String),
    #[error("build interrupted before {0}")]
    Interrupted(&'static str),
    #[error("build record error: {0}")]
    Record(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether the failure means fetched or installed content could not be trusted.
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_integrity_failure(),
            Self::Record(_) => true,
            _ => false,
        }
    }

    /// Whether the failure comes from declarative input (manifest, config, units).
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Manifest(_)
                | Self::Unit(_)
                | Self::Arch(_)
                | Self::DependencyCycle(_)
                | Self::Fetch(docket_fetch::FetchError::MissingPin { .. })
        )
    }
}
