//! Service unit definitions.
//!
//! One TOML file per unit lives in the units directory. Every unit states its
//! timeout policy explicitly; there is no default for `on_timeout`.

use crate::types::UnitName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("failed to read unit definitions: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse unit file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unit name must not be empty")]
    EmptyName,
    #[error("unit '{0}' is defined more than once")]
    Duplicate(String),
    #[error("unit '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("unit '{0}' depends on itself")]
    SelfDependency(String),
    #[error("unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },
    #[error("unit '{0}': readiness exec probe has an empty command")]
    EmptyProbeCommand(String),
    #[error("unit '{0}': max_wait must be greater than zero")]
    ZeroMaxWait(String),
    #[error("unit '{unit}': invalid restart backoff: {reason}")]
    InvalidBackoff { unit: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Long-running daemon; ready once its probe passes.
    #[default]
    Longrun,
    /// Runs to completion; ready once it exits 0.
    Oneshot,
}

/// What happens when a unit does not become ready within `max_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// The whole container fails.
    Fail,
    /// The unit is skipped and supervision continues.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReadinessProbe {
    /// Command exits 0.
    Exec {
        command: Vec<String>,
        #[serde(default = "default_probe_interval", with = "humantime_serde")]
        interval: Duration,
    },
    /// A TCP connection to `address` succeeds.
    Tcp {
        address: String,
        #[serde(default = "default_probe_interval", with = "humantime_serde")]
        interval: Duration,
    },
    /// The path (file or socket) exists.
    Path {
        path: PathBuf,
        #[serde(default = "default_probe_interval", with = "humantime_serde")]
        interval: Duration,
    },
}

impl ReadinessProbe {
    pub fn interval(&self) -> Duration {
        match self {
            Self::Exec { interval, .. } | Self::Tcp { interval, .. } | Self::Path { interval, .. } => {
                *interval
            }
        }
    }
}

fn default_probe_interval() -> Duration {
    Duration::from_millis(500)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    /// Any exit fails the container.
    Never,
    /// Restart on non-zero or signal exits; exit 0 ends the unit.
    #[default]
    OnFailure,
    /// Restart on every exit.
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    Linear {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde")]
        increment: Duration,
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
    Exponential {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Why this backoff cannot be used, if anything.
    pub fn problem(&self) -> Option<String> {
        match self {
            Self::Fixed { .. } => None,
            Self::Linear {
                initial_delay,
                max_delay,
                ..
            } => (initial_delay > max_delay).then(|| {
                format!("initial_delay {initial_delay:?} exceeds max_delay {max_delay:?}")
            }),
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    Some(format!("multiplier must be a finite number of at least 1, got {multiplier}"))
                } else if initial_delay > max_delay {
                    Some(format!(
                        "initial_delay {initial_delay:?} exceeds max_delay {max_delay:?}"
                    ))
                } else {
                    None
                }
            }
        }
    }

    /// Delay before restart number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => (*initial_delay + increment.saturating_mul(step)).min(*max_delay),
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exponent = i32::try_from(step).unwrap_or(i32::MAX);
                let secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                Duration::try_from_secs_f64(secs).map_or(*max_delay, |delay| delay.min(*max_delay))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartPolicy {
    #[serde(default)]
    pub mode: RestartMode,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window", with = "humantime_serde")]
    pub window: Duration,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            mode: RestartMode::default(),
            max_restarts: default_max_restarts(),
            window: default_restart_window(),
            backoff: Backoff::default(),
        }
    }
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_window() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitDefinition {
    pub name: UnitName,
    #[serde(default)]
    pub kind: UnitKind,
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub depends_on: Vec<UnitName>,
    #[serde(default)]
    pub readiness: Option<ReadinessProbe>,
    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,
    pub on_timeout: TimeoutPolicy,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

fn default_max_wait() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

pub fn parse_unit_str(input: &str) -> Result<UnitDefinition, toml::de::Error> {
    toml::from_str(input)
}

/// Load every `*.toml` file in `dir`, sorted by file name, and validate the set.
pub fn load_units_dir(dir: &Path) -> Result<Vec<UnitDefinition>, UnitError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut units = Vec::with_capacity(paths.len());
    for path in paths {
        let content = fs::read_to_string(&path)?;
        let unit = parse_unit_str(&content).map_err(|source| UnitError::Parse {
            path: path.clone(),
            source,
        })?;
        units.push(unit);
    }
    validate_units(&units)?;
    Ok(units)
}

/// Check names, commands and dependency references. Cycles are detected by the graph builder.
pub fn validate_units(units: &[UnitDefinition]) -> Result<(), UnitError> {
    let mut names = BTreeSet::new();
    for unit in units {
        if unit.name.trim().is_empty() {
            return Err(UnitError::EmptyName);
        }
        if !names.insert(unit.name.as_str()) {
            return Err(UnitError::Duplicate(unit.name.to_string()));
        }
        if unit.command.first().is_none_or(|program| program.is_empty()) {
            return Err(UnitError::EmptyCommand(unit.name.to_string()));
        }
        if unit.max_wait.is_zero() {
            return Err(UnitError::ZeroMaxWait(unit.name.to_string()));
        }
        if let Some(reason) = unit.restart.backoff.problem() {
            return Err(UnitError::InvalidBackoff {
                unit: unit.name.to_string(),
                reason,
            });
        }
        if let Some(ReadinessProbe::Exec { command, .. }) = &unit.readiness {
            if command.is_empty() {
                return Err(UnitError::EmptyProbeCommand(unit.name.to_string()));
            }
        }
    }
    for unit in units {
        for dep in &unit.depends_on {
            if dep == &unit.name {
                return Err(UnitError::SelfDependency(unit.name.to_string()));
            }
            if !names.contains(dep.as_str()) {
                return Err(UnitError::UnknownDependency {
                    unit: unit.name.to_string(),
                    dependency: dep.to_string(),
                });
            }
        }
    }
    Ok(())
}
