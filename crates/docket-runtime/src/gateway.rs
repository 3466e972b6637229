//! Management-command gateway.
//!
//! Operator commands reach the application only through here. A privileged
//! caller is re-executed as the service account (supplementary groups
//! cleared) by replacing the current process image, so nothing privileged
//! survives into application code. Unknown callers are refused.

use crate::identity::{Identity, IdentityKind};
use crate::RuntimeError;
use docket_schema::ContainerConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::Command;

/// `EX_NOPERM` from sysexits.h.
pub const EXIT_UNKNOWN_IDENTITY: i32 = 77;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub identity: Identity,
    pub subcommand: String,
    pub args: Vec<String>,
}

/// The exact process a management command becomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandPlan {
    pub identity: Identity,
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// uid/gid to switch to before the program starts.
    pub drop_to: Option<(u32, u32)>,
}

/// Login variables a process dropped to `user` should see instead of root's.
pub fn account_environment(user: &str, home: &Path) -> [(String, String); 3] {
    [
        ("HOME".to_owned(), home.display().to_string()),
        ("USER".to_owned(), user.to_owned()),
        ("LOGNAME".to_owned(), user.to_owned()),
    ]
}

pub fn plan_invocation(
    invocation: &Invocation,
    config: &ContainerConfig,
) -> Result<CommandPlan, RuntimeError> {
    let identity = &invocation.identity;
    let drop_to = match identity.kind {
        IdentityKind::Privileged => Some((config.account.uid, config.account.gid)),
        IdentityKind::ServiceAccount => None,
        IdentityKind::Unknown => {
            return Err(RuntimeError::UnknownIdentity {
                uid: identity.uid,
                name: identity.name.clone(),
            })
        }
    };

    let mut args = config.app.manage_args.clone();
    args.push(invocation.subcommand.clone());
    args.extend(invocation.args.iter().cloned());

    let mut env = config.app.environment.clone();
    if drop_to.is_some() {
        env.extend(account_environment(&config.account.name, &config.account.home));
    }

    Ok(CommandPlan {
        identity: identity.clone(),
        program: config.app.manage_program.clone(),
        args,
        workdir: config.app.workdir.clone(),
        env,
        drop_to,
    })
}

impl CommandPlan {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.workdir)
            .envs(&self.env);
        if let Some((uid, gid)) = self.drop_to {
            // std calls setgroups(0) before setgid/setuid when started as root.
            cmd.gid(gid).uid(uid);
        }
        cmd
    }

    /// Replace the current process. Only returns on failure.
    pub fn exec(&self) -> RuntimeError {
        tracing::debug!(
            identity = %self.identity.kind,
            drop_to = ?self.drop_to,
            "exec {} {:?}",
            self.program,
            self.args
        );
        let source = self.command().exec();
        RuntimeError::Spawn {
            program: self.program.clone(),
            source,
        }
    }

    /// Run as a child and return its exit status unchanged (128 + signal when killed).
    pub fn run(&self) -> Result<i32, RuntimeError> {
        tracing::debug!(
            identity = %self.identity.kind,
            drop_to = ?self.drop_to,
            "spawn {} {:?}",
            self.program,
            self.args
        );
        let status = self
            .command()
            .status()
            .map_err(|source| RuntimeError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        Ok(status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(1))
    }
}
