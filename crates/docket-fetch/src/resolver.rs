use crate::checksum::verify_checksum;
use crate::source::ArtifactSource;
use crate::FetchError;
use docket_schema::{
    ArchTarget, ArtifactName, ArtifactSpec, BuildManifest, Checksum, InstallKind,
    PackageInstaller, PinnedVersion,
};
use serde::Serialize;
use std::path::PathBuf;

/// An artifact bound to one architecture target: concrete location and checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedArtifact {
    pub name: ArtifactName,
    pub version: PinnedVersion,
    pub target: ArchTarget,
    pub location: String,
    pub checksum: Checksum,
    pub install: InstallKind,
    pub installer: Option<PackageInstaller>,
    pub destination: Option<PathBuf>,
}

impl ResolvedArtifact {
    /// Last path segment of the location, used when staging package files.
    pub fn file_name(&self) -> &str {
        let without_query = self
            .location
            .split(['?', '#'])
            .next()
            .unwrap_or(&self.location);
        without_query
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(self.name.as_str())
    }
}

/// Bytes whose checksum matched the pin exactly.
#[derive(Debug, Clone)]
pub struct VerifiedArtifact {
    pub artifact: ResolvedArtifact,
    pub data: Vec<u8>,
}

/// Every artifact resolved for one target, before anything is fetched.
#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
    pub target: ArchTarget,
    pub artifacts: Vec<ResolvedArtifact>,
}

/// Substitute `{name}`, `{version}` and `{arch}` into a source template.
pub fn render_template(template: &str, name: &str, version: &str, arch: &str) -> String {
    template
        .replace("{name}", name)
        .replace("{version}", version)
        .replace("{arch}", arch)
}

pub fn resolve_artifact(
    spec: &ArtifactSpec,
    target: ArchTarget,
) -> Result<ResolvedArtifact, FetchError> {
    let checksum = spec
        .pins
        .for_target(target)
        .cloned()
        .ok_or_else(|| FetchError::MissingPin {
            name: spec.name.to_string(),
            target,
        })?;
    let location = render_template(
        &spec.source,
        &spec.name,
        &spec.version,
        target.render(spec.arch_style),
    );
    Ok(ResolvedArtifact {
        name: spec.name.clone(),
        version: spec.version.clone(),
        target,
        location,
        checksum,
        install: spec.install,
        installer: spec.installer,
        destination: spec.destination.clone(),
    })
}

pub fn resolve_all(manifest: &BuildManifest, target: ArchTarget) -> Result<BuildPlan, FetchError> {
    let artifacts = manifest
        .artifacts
        .iter()
        .map(|spec| resolve_artifact(spec, target))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BuildPlan { target, artifacts })
}

pub fn fetch_and_verify(
    artifact: &ResolvedArtifact,
    source: &dyn ArtifactSource,
) -> Result<VerifiedArtifact, FetchError> {
    tracing::info!(
        artifact = %artifact.name,
        version = %artifact.version,
        "fetching {}",
        artifact.location
    );
    let data = source.fetch(&artifact.location)?;
    verify_checksum(&artifact.name, &artifact.checksum, &data)?;
    tracing::debug!(artifact = %artifact.name, "checksum verified ({})", artifact.checksum);
    Ok(VerifiedArtifact {
        artifact: artifact.clone(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_checksum;
    use docket_schema::{parse_manifest_str, ChecksumAlgorithm};
    use std::collections::HashMap;

    struct MapSource(HashMap<String, Vec<u8>>);

    impl ArtifactSource for MapSource {
        fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError> {
            self.0
                .get(location)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(location.to_owned()))
        }
    }

    fn sha(data: &[u8]) -> String {
        compute_checksum(ChecksumAlgorithm::Sha256, data)
    }

    fn manifest(pins: &str) -> BuildManifest {
        parse_manifest_str(&format!(
            r#"
manifest_version = 1

[[artifact]]
name = "jbig2enc"
version = "0.29"
source = "https://mirror.example/{{name}}/{{version}}/{{name}}_{{arch}}.deb"
install = "package"
installer = "dpkg"

[artifact.checksums]
{pins}
"#
        ))
        .unwrap()
        .validate()
        .unwrap()
    }

    #[test]
    fn template_substitutes_all_placeholders() {
        assert_eq!(
            render_template("{name}-{version}-{arch}/{name}", "q", "1.0", "armhf"),
            "q-1.0-armhf/q"
        );
    }

    #[test]
    fn resolves_location_and_pin_per_target() {
        let m = manifest(&format!(
            "amd64 = \"{}\"\narmv7 = \"{}\"",
            sha(b"amd"),
            sha(b"arm")
        ));
        let amd = resolve_artifact(&m.artifacts[0], ArchTarget::Amd64).unwrap();
        assert_eq!(
            amd.location,
            "https://mirror.example/jbig2enc/0.29/jbig2enc_amd64.deb"
        );
        let arm = resolve_artifact(&m.artifacts[0], ArchTarget::ArmV7).unwrap();
        assert_eq!(
            arm.location,
            "https://mirror.example/jbig2enc/0.29/jbig2enc_armhf.deb"
        );
        assert_ne!(amd.checksum, arm.checksum);
        assert_eq!(arm.file_name(), "jbig2enc_armhf.deb");
    }

    #[test]
    fn missing_pin_for_target_is_an_error() {
        let m = manifest(&format!("amd64 = \"{}\"", sha(b"amd")));
        let err = resolve_all(&m, ArchTarget::Arm64).unwrap_err();
        assert!(
            matches!(err, FetchError::MissingPin { ref name, target } if name == "jbig2enc" && target == ArchTarget::Arm64)
        );
    }

    #[test]
    fn fetch_and_verify_accepts_matching_bytes() {
        let m = manifest(&format!("amd64 = \"{}\"", sha(b"payload")));
        let resolved = resolve_artifact(&m.artifacts[0], ArchTarget::Amd64).unwrap();
        let source = MapSource(HashMap::from([(
            resolved.location.clone(),
            b"payload".to_vec(),
        )]));
        let verified = fetch_and_verify(&resolved, &source).unwrap();
        assert_eq!(verified.data, b"payload");
    }

    #[test]
    fn fetch_and_verify_rejects_single_byte_mutation() {
        let m = manifest(&format!("amd64 = \"{}\"", sha(b"payload")));
        let resolved = resolve_artifact(&m.artifacts[0], ArchTarget::Amd64).unwrap();
        let source = MapSource(HashMap::from([(
            resolved.location.clone(),
            b"paylaod".to_vec(),
        )]));
        let err = fetch_and_verify(&resolved, &source).unwrap_err();
        assert!(matches!(err, FetchError::ChecksumMismatch { .. }));
    }
}
