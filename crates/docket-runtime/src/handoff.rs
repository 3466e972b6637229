//! First-process handoff.
//!
//! The container's first process starts the supervision runtime as a separate
//! child, forwards termination signals to it, reaps whatever gets reparented
//! to it, and exits with the runtime's status.

use crate::RuntimeError;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};

/// Pid of the supervision runtime, read by the signal-forwarding thread.
static SUPERVISOR_PID: AtomicI32 = AtomicI32::new(0);

/// Decode a raw `waitpid` status into a shell-style exit code.
pub fn exit_code_from_wait_status(status: i32) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

fn forward_term() {
    let pid = SUPERVISOR_PID.load(Ordering::SeqCst);
    if pid <= 0 {
        return;
    }
    // SAFETY: kill() with a positive pid and a valid signal number is safe.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret != 0 {
        tracing::warn!(
            "failed to forward SIGTERM to pid {pid}: {}",
            std::io::Error::last_os_error()
        );
    } else {
        tracing::info!("forwarded SIGTERM to supervisor (pid {pid})");
    }
}

/// Blocking `waitpid`, retried on EINTR.
#[allow(unsafe_code)]
fn wait_for(pid: i32) -> std::io::Result<(i32, i32)> {
    loop {
        let mut status: i32 = 0;
        // SAFETY: status is a valid, writable i32 on the stack.
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret >= 0 {
            return Ok((ret, status));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Spawn `program` and block until it exits.
///
/// With `reap_orphans` every child of this process is reaped while waiting,
/// which is what the first process in a container has to do.
pub fn spawn_and_reap(
    program: &Path,
    args: &[String],
    reap_orphans: bool,
) -> Result<i32, RuntimeError> {
    let child = Command::new(program)
        .args(args)
        .spawn()
        .map_err(|source| RuntimeError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
    let pid = i32::try_from(child.id())
        .map_err(|_| RuntimeError::ExecFailed(format!("pid {} out of range", child.id())))?;
    SUPERVISOR_PID.store(pid, Ordering::SeqCst);
    tracing::info!("supervisor started (pid {pid})");

    let wait_target = if reap_orphans { -1 } else { pid };
    let code = loop {
        let (reaped, status) = wait_for(wait_target)?;
        if reaped == pid {
            break exit_code_from_wait_status(status);
        }
        tracing::debug!(
            "reaped orphan pid {reaped} ({})",
            exit_code_from_wait_status(status)
        );
    };
    SUPERVISOR_PID.store(0, Ordering::SeqCst);
    // The child was reaped through waitpid; `child` only holds its pid.
    drop(child);
    tracing::info!("supervisor exited with status {code}");
    Ok(code)
}

/// Act as the container's first process: hand off to the supervisor and return its exit status.
pub fn run_first_process(program: &Path, args: &[String]) -> Result<i32, RuntimeError> {
    ctrlc::set_handler(forward_term)
        .map_err(|e| RuntimeError::ExecFailed(format!("failed to install signal handler: {e}")))?;
    let reap_orphans = std::process::id() == 1;
    spawn_and_reap(program, args, reap_orphans)
}
