use crate::probe;
use crate::RuntimeError;
use async_trait::async_trait;
use docket_schema::{ReadinessProbe, UnitName};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;

/// How a unit process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
}

impl ExitOutcome {
    pub fn success(self) -> bool {
        self == Self::Code(0)
    }

    /// Shell-style exit status: the code, or 128 + signal number.
    pub fn as_status(self) -> i32 {
        match self {
            Self::Code(c) => c,
            Self::Signal(s) => 128 + s,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(c) => write!(f, "exit code {c}"),
            Self::Signal(s) => write!(f, "signal {s}"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(c), _) => Self::Code(c),
            (None, Some(s)) => Self::Signal(s),
            (None, None) => Self::Code(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopSignal {
    Term,
    Kill,
}

impl StopSignal {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Everything needed to start one run of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub unit: UnitName,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
    /// uid/gid the process runs as; `None` keeps the launcher's identity.
    pub run_as: Option<(u32, u32)>,
}

/// A started unit process.
#[async_trait]
pub trait UnitProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to end. Cancel-safe.
    async fn wait(&mut self) -> Result<ExitOutcome, RuntimeError>;

    fn signal(&mut self, signal: StopSignal) -> Result<(), RuntimeError>;
}

/// Starts unit processes and answers readiness probes for them.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn UnitProcess>, RuntimeError>;

    /// One probe attempt; `true` when the unit is ready.
    async fn probe(&self, spec: &LaunchSpec, probe: &ReadinessProbe) -> bool;
}

/// Launches real child processes with tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

struct ChildProcess {
    unit: UnitName,
    child: tokio::process::Child,
    pid: Option<u32>,
}

#[async_trait]
impl UnitProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<ExitOutcome, RuntimeError> {
        let status = self.child.wait().await?;
        // Reaped; the pid may be reused from here on.
        self.pid = None;
        Ok(status.into())
    }

    fn signal(&mut self, signal: StopSignal) -> Result<(), RuntimeError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|_| RuntimeError::Signal {
            pid: -1,
            message: format!("pid {pid} out of range"),
        })?;
        tracing::debug!(unit = %self.unit, "sending {signal:?} to pid {pid}");
        // SAFETY: kill() with a valid pid and signal is safe; pid validated via i32::try_from above.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, signal.as_raw()) };
        if ret != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::ESRCH) {
                tracing::debug!(unit = %self.unit, "pid {pid} already exited");
                return Ok(());
            }
            return Err(RuntimeError::Signal {
                pid,
                message: errno.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn UnitProcess>, RuntimeError> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        if let Some(dir) = &spec.workdir {
            cmd.current_dir(dir);
        }
        if let Some((uid, gid)) = spec.run_as {
            cmd.gid(gid).uid(uid);
        }
        let child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(unit = %spec.unit, pid = ?pid, "started {}", spec.program);
        Ok(Box::new(ChildProcess {
            unit: spec.unit.clone(),
            child,
            pid,
        }))
    }

    async fn probe(&self, spec: &LaunchSpec, probe: &ReadinessProbe) -> bool {
        probe::check(probe, spec).await
    }
}
