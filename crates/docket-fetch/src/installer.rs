use crate::resolver::VerifiedArtifact;
use crate::FetchError;
use docket_schema::{ArtifactName, ContainerConfig, InstallKind, PackageInstaller, PinnedVersion};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::NamedTempFile;

/// Runs a package installer against a staged, already verified package file.
pub trait PackageRunner {
    fn run(
        &self,
        installer: PackageInstaller,
        package: &Path,
        root: &Path,
    ) -> Result<(), String>;
}

/// Invokes `dpkg` or `pip` as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn command(installer: PackageInstaller, package: &Path, root: &Path) -> Command {
        let alternate_root = root != Path::new("/");
        match installer {
            PackageInstaller::Dpkg => {
                let mut cmd = Command::new("dpkg");
                if alternate_root {
                    cmd.arg(format!("--root={}", root.display()));
                }
                cmd.arg("--install").arg(package);
                cmd
            }
            PackageInstaller::Pip => {
                let mut cmd = Command::new("python3");
                cmd.args(["-m", "pip", "install", "--no-deps", "--no-cache-dir"]);
                if alternate_root {
                    cmd.arg("--root").arg(root);
                }
                cmd.arg(package);
                cmd
            }
        }
    }
}

impl PackageRunner for CommandRunner {
    fn run(
        &self,
        installer: PackageInstaller,
        package: &Path,
        root: &Path,
    ) -> Result<(), String> {
        let mut cmd = Self::command(installer, package, root);
        tracing::debug!("running {cmd:?}");
        let output = cmd.output().map_err(|e| format!("failed to spawn: {e}"))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("{}: {}", output.status, stderr.trim()))
    }
}

/// What ended up in the image for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledArtifact {
    pub name: ArtifactName,
    pub version: PinnedVersion,
    pub install: InstallKind,
    pub destination: Option<PathBuf>,
    pub checksum: String,
}

/// Install a verified artifact under `root`.
pub fn install(
    verified: &VerifiedArtifact,
    root: &Path,
    runner: &dyn PackageRunner,
) -> Result<InstalledArtifact, FetchError> {
    let artifact = &verified.artifact;
    match artifact.install {
        InstallKind::Binary | InstallKind::Library => {
            let mode = if artifact.install == InstallKind::Binary {
                0o755
            } else {
                0o644
            };
            let destination = artifact.destination.as_deref().ok_or_else(|| {
                FetchError::InstallerFailed {
                    name: artifact.name.to_string(),
                    installer: artifact.install.to_string(),
                    message: "no destination".to_owned(),
                }
            })?;
            let target = ContainerConfig::in_root(root, destination);
            write_atomic(&target, &verified.data, mode)?;
            tracing::info!(
                artifact = %artifact.name,
                "installed {} ({:o})",
                destination.display(),
                mode
            );
        }
        InstallKind::Package => {
            let installer = artifact.installer.ok_or_else(|| FetchError::InstallerFailed {
                name: artifact.name.to_string(),
                installer: "package".to_owned(),
                message: "no installer".to_owned(),
            })?;
            let staging = tempfile::Builder::new()
                .prefix("docket-package-")
                .tempdir()?;
            let staged = staging.path().join(artifact.file_name());
            fs::write(&staged, &verified.data)?;
            runner
                .run(installer, &staged, root)
                .map_err(|message| FetchError::InstallerFailed {
                    name: artifact.name.to_string(),
                    installer: installer.to_string(),
                    message,
                })?;
            tracing::info!(artifact = %artifact.name, "installed package {}", artifact.file_name());
        }
    }
    Ok(InstalledArtifact {
        name: artifact.name.clone(),
        version: artifact.version.clone(),
        install: artifact.install,
        destination: artifact.destination.clone(),
        checksum: artifact.checksum.to_string(),
    })
}

/// Write through a temp file in the destination directory, then rename over the target.
pub fn write_atomic(target: &Path, data: &[u8], mode: u32) -> Result<(), FetchError> {
    let dir = target
        .parent()
        .ok_or_else(|| FetchError::Image(format!("{} has no parent", target.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))?;
    tmp.persist(target).map_err(|e| FetchError::Io(e.error))?;
    Ok(())
}
