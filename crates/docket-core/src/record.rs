//! Build record written into the image after a successful build.

use crate::CoreError;
use docket_fetch::{verify_checksum, InstalledArtifact, OverlayReport};
use docket_schema::{ArchTarget, ArtifactName, Checksum, ContainerConfig, InstallKind, PinnedVersion};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const BUILD_RECORD_FILE: &str = "build.json";
const RECORD_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedArtifact {
    pub name: ArtifactName,
    pub version: PinnedVersion,
    pub install: InstallKind,
    pub destination: Option<PathBuf>,
    pub checksum: String,
}

impl From<&InstalledArtifact> for RecordedArtifact {
    fn from(installed: &InstalledArtifact) -> Self {
        Self {
            name: installed.name.clone(),
            version: installed.version.clone(),
            install: installed.install,
            destination: installed.destination.clone(),
            checksum: installed.checksum.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedOverlay {
    pub version: String,
    /// `(archive file, checksum)` in extraction order.
    pub archives: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub format_version: u32,
    pub target: ArchTarget,
    pub built_at: String,
    pub overlay: Option<RecordedOverlay>,
    pub artifacts: Vec<RecordedArtifact>,
}

impl BuildRecord {
    pub fn new(
        target: ArchTarget,
        installed: &[InstalledArtifact],
        overlay: Option<&OverlayReport>,
    ) -> Self {
        Self {
            format_version: RECORD_FORMAT_VERSION,
            target,
            built_at: chrono::Utc::now().to_rfc3339(),
            overlay: overlay.map(|report| RecordedOverlay {
                version: report.version.clone(),
                archives: report.archives.clone(),
            }),
            artifacts: installed.iter().map(RecordedArtifact::from).collect(),
        }
    }

    pub fn path_in(state_dir: &Path) -> PathBuf {
        state_dir.join(BUILD_RECORD_FILE)
    }

    /// Write atomically into `state_dir`.
    pub fn write(&self, state_dir: &Path) -> Result<PathBuf, CoreError> {
        fs::create_dir_all(state_dir)?;
        let path = Self::path_in(state_dir);
        let json = serde_json::to_string_pretty(self)?;
        let mut tmp = NamedTempFile::new_in(state_dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| CoreError::Io(e.error))?;
        Ok(path)
    }

    pub fn load(state_dir: &Path) -> Result<Self, CoreError> {
        let path = Self::path_in(state_dir);
        let content = fs::read_to_string(&path).map_err(|e| {
            CoreError::Record(format!("cannot read {}: {e}", path.display()))
        })?;
        let record: Self = serde_json::from_str(&content)?;
        if record.format_version != RECORD_FORMAT_VERSION {
            return Err(CoreError::Record(format!(
                "unsupported build record format {}",
                record.format_version
            )));
        }
        Ok(record)
    }

    /// Re-hash every installed file under `root` against its recorded checksum.
    ///
    /// Package artifacts have no single destination and are not re-checked.
    pub fn verify(&self, root: &Path) -> Result<Vec<ArtifactName>, CoreError> {
        let mut verified = Vec::new();
        for artifact in &self.artifacts {
            let Some(destination) = &artifact.destination else {
                continue;
            };
            if artifact.install == InstallKind::Package {
                continue;
            }
            let checksum: Checksum = artifact.checksum.parse().map_err(|e| {
                CoreError::Record(format!("artifact '{}': {e}", artifact.name))
            })?;
            let path = ContainerConfig::in_root(root, destination);
            let data = fs::read(&path).map_err(|e| {
                CoreError::Record(format!(
                    "artifact '{}': cannot read {}: {e}",
                    artifact.name,
                    path.display()
                ))
            })?;
            verify_checksum(&artifact.name, &checksum, &data)?;
            tracing::debug!(artifact = %artifact.name, "verified {}", destination.display());
            verified.push(artifact.name.clone());
        }
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_fetch::compute_checksum;
    use docket_schema::ChecksumAlgorithm;

    fn installed(destination: &str, data: &[u8]) -> InstalledArtifact {
        InstalledArtifact {
            name: ArtifactName::new("qpdf"),
            version: PinnedVersion::new("11.9.0"),
            install: InstallKind::Binary,
            destination: Some(PathBuf::from(destination)),
            checksum: compute_checksum(ChecksumAlgorithm::Sha256, data),
        }
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let record = BuildRecord::new(ArchTarget::Arm64, &[installed("/usr/bin/qpdf", b"x")], None);
        let path = record.write(dir.path()).unwrap();
        assert!(path.ends_with(BUILD_RECORD_FILE));
        assert_eq!(BuildRecord::load(dir.path()).unwrap(), record);
    }

    #[test]
    fn verify_detects_modified_file() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("usr/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("qpdf"), b"original").unwrap();
        let record = BuildRecord::new(
            ArchTarget::Amd64,
            &[installed("/usr/bin/qpdf", b"original")],
            None,
        );
        assert_eq!(record.verify(root.path()).unwrap(), [ArtifactName::new("qpdf")]);

        fs::write(bin.join("qpdf"), b"tampered").unwrap();
        let err = record.verify(root.path()).unwrap_err();
        assert!(err.is_integrity_failure());
    }

    #[test]
    fn verify_reports_missing_file() {
        let root = tempfile::tempdir().unwrap();
        let record = BuildRecord::new(ArchTarget::Amd64, &[installed("/usr/bin/qpdf", b"x")], None);
        assert!(matches!(record.verify(root.path()), Err(CoreError::Record(_))));
    }

    #[test]
    fn missing_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(BuildRecord::load(dir.path()), Err(CoreError::Record(_))));
    }
}
