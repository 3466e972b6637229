//! Readiness probes.

use crate::launcher::LaunchSpec;
use docket_schema::ReadinessProbe;
use std::process::Stdio;
use std::time::Duration;

/// Upper bound for a single probe attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Run one probe attempt for the unit described by `spec`.
pub async fn check(probe: &ReadinessProbe, spec: &LaunchSpec) -> bool {
    let timeout = probe.interval().clamp(Duration::from_millis(100), ATTEMPT_TIMEOUT);
    match probe {
        ReadinessProbe::Exec { command, .. } => exec_probe(command, spec, timeout).await,
        ReadinessProbe::Tcp { address, .. } => tcp_probe(address, timeout).await,
        ReadinessProbe::Path { path, .. } => tokio::fs::try_exists(path).await.unwrap_or(false),
    }
}

async fn exec_probe(command: &[String], spec: &LaunchSpec, timeout: Duration) -> bool {
    let Some((program, args)) = command.split_first() else {
        return false;
    };
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = &spec.workdir {
        cmd.current_dir(dir);
    }
    if let Some((uid, gid)) = spec.run_as {
        cmd.gid(gid).uid(uid);
    }
    match tokio::time::timeout(timeout, cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            tracing::debug!(unit = %spec.unit, "probe command failed to start: {e}");
            false
        }
        Err(_) => false,
    }
}

async fn tcp_probe(address: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_schema::UnitName;
    use std::collections::BTreeMap;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            unit: UnitName::new("probe-test"),
            program: "true".to_owned(),
            args: vec![],
            env: BTreeMap::new(),
            workdir: None,
            run_as: None,
        }
    }

    fn interval() -> Duration {
        Duration::from_millis(200)
    }

    #[tokio::test]
    async fn exec_probe_follows_exit_status() {
        let ok = ReadinessProbe::Exec {
            command: vec!["sh".to_owned(), "-c".to_owned(), "exit 0".to_owned()],
            interval: interval(),
        };
        let fail = ReadinessProbe::Exec {
            command: vec!["sh".to_owned(), "-c".to_owned(), "exit 1".to_owned()],
            interval: interval(),
        };
        assert!(check(&ok, &spec()).await);
        assert!(!check(&fail, &spec()).await);
    }

    #[tokio::test]
    async fn path_probe_checks_existence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready");
        let probe = ReadinessProbe::Path {
            path: path.clone(),
            interval: interval(),
        };
        assert!(!check(&probe, &spec()).await);
        std::fs::write(&path, b"").unwrap();
        assert!(check(&probe, &spec()).await);
    }

    #[tokio::test]
    async fn tcp_probe_needs_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let probe = ReadinessProbe::Tcp {
            address: addr.clone(),
            interval: interval(),
        };
        assert!(check(&probe, &spec()).await);
        drop(listener);
        assert!(!check(&probe, &spec()).await);
    }
}
