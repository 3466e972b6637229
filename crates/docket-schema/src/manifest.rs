use crate::arch::{ArchStyle, ArchTarget};
use crate::checksum::{Checksum, ChecksumParseError};
use crate::config::{AppSection, ContainerConfig, EntrySection, PathsSection, ServiceAccount};
use crate::types::{ArtifactName, PinnedVersion};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholders an artifact source template may contain.
pub const TEMPLATE_PLACEHOLDERS: [&str; 3] = ["name", "version", "arch"];

pub const DEFAULT_OVERLAY_BASE_URL: &str =
    "https://github.com/just-containers/s6-overlay/releases/download/v{version}";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("artifact name must not be empty")]
    EmptyArtifactName,
    #[error("artifact '{0}' is declared more than once")]
    DuplicateArtifact(String),
    #[error("artifact '{0}' has an empty version")]
    EmptyVersion(String),
    #[error("artifact '{name}' pins version {version} but declares no checksum")]
    MissingChecksum { name: String, version: String },
    #[error("artifact '{name}' declares both 'checksum' and 'checksums'")]
    AmbiguousChecksum { name: String },
    #[error("artifact '{name}': invalid checksum: {source}")]
    InvalidChecksum {
        name: String,
        #[source]
        source: ChecksumParseError,
    },
    #[error("artifact '{name}': source template must not be empty")]
    EmptySource { name: String },
    #[error("artifact '{name}': unknown placeholder '{{{placeholder}}}' in source template")]
    UnknownPlaceholder { name: String, placeholder: String },
    #[error("artifact '{name}': unterminated placeholder in source template")]
    UnterminatedPlaceholder { name: String },
    #[error("artifact '{name}': {install} artifacts need an absolute destination")]
    MissingDestination { name: String, install: InstallKind },
    #[error("artifact '{name}': package artifacts need an installer (dpkg or pip)")]
    MissingInstaller { name: String },
    #[error("overlay version must not be empty")]
    EmptyOverlayVersion,
    #[error("overlay: invalid pinned checksum for '{archive}': {source}")]
    InvalidOverlayPin {
        archive: String,
        #[source]
        source: ChecksumParseError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallKind {
    /// Single executable written to its destination with mode 0755.
    Binary,
    /// Single shared object or data file written with mode 0644.
    Library,
    /// Handed to a package installer.
    Package,
}

impl std::fmt::Display for InstallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Binary => "binary",
            Self::Library => "library",
            Self::Package => "package",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageInstaller {
    Dpkg,
    Pip,
}

impl std::fmt::Display for PackageInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Dpkg => "dpkg",
            Self::Pip => "pip",
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSection {
    pub name: ArtifactName,
    pub version: PinnedVersion,
    /// URL or path template with `{name}`, `{version}` and `{arch}` placeholders.
    pub source: String,
    #[serde(default)]
    pub arch_style: ArchStyle,
    pub install: InstallKind,
    #[serde(default)]
    pub installer: Option<PackageInstaller>,
    #[serde(default)]
    pub destination: Option<PathBuf>,
    /// Architecture-independent checksum.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Per-target checksums.
    #[serde(default)]
    pub checksums: BTreeMap<ArchTarget, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OverlaySection {
    pub version: PinnedVersion,
    #[serde(default = "default_overlay_base_url")]
    pub base_url: String,
    /// Optional pins keyed by archive file name, checked on top of the published `.sha256` files.
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

fn default_overlay_base_url() -> String {
    DEFAULT_OVERLAY_BASE_URL.to_owned()
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestV1 {
    pub manifest_version: u32,
    #[serde(default)]
    pub account: ServiceAccount,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub entry: EntrySection,
    #[serde(default)]
    pub overlay: Option<OverlaySection>,
    #[serde(default, rename = "artifact")]
    pub artifacts: Vec<ArtifactSection>,
}

/// How an artifact's checksum is pinned once the manifest is validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumPins {
    Any(Checksum),
    PerTarget(BTreeMap<ArchTarget, Checksum>),
}

impl ChecksumPins {
    pub fn for_target(&self, target: ArchTarget) -> Option<&Checksum> {
        match self {
            Self::Any(c) => Some(c),
            Self::PerTarget(map) => map.get(&target),
        }
    }
}

/// An artifact declaration that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactSpec {
    pub name: ArtifactName,
    pub version: PinnedVersion,
    pub source: String,
    pub arch_style: ArchStyle,
    pub install: InstallKind,
    pub installer: Option<PackageInstaller>,
    pub destination: Option<PathBuf>,
    pub pins: ChecksumPins,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlaySpec {
    pub version: PinnedVersion,
    pub base_url: String,
    pub pins: BTreeMap<String, Checksum>,
}

/// Validated build manifest plus the container configuration it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildManifest {
    pub config: ContainerConfig,
    pub overlay: Option<OverlaySpec>,
    pub artifacts: Vec<ArtifactSpec>,
}

impl ManifestV1 {
    pub fn container_config(&self) -> ContainerConfig {
        ContainerConfig {
            account: self.account.clone(),
            paths: self.paths.clone(),
            app: self.app.clone(),
            entry: self.entry.clone(),
        }
    }

    pub fn validate(self) -> Result<BuildManifest, ManifestError> {
        if self.manifest_version != 1 {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }
        let config = self.container_config();

        let mut seen = BTreeSet::new();
        let mut artifacts = Vec::with_capacity(self.artifacts.len());
        for section in self.artifacts {
            if section.name.trim().is_empty() {
                return Err(ManifestError::EmptyArtifactName);
            }
            if !seen.insert(section.name.clone()) {
                return Err(ManifestError::DuplicateArtifact(section.name.into_inner()));
            }
            artifacts.push(validate_artifact(section)?);
        }

        let overlay = self.overlay.map(validate_overlay).transpose()?;

        Ok(BuildManifest {
            config,
            overlay,
            artifacts,
        })
    }
}

fn validate_artifact(section: ArtifactSection) -> Result<ArtifactSpec, ManifestError> {
    let name = section.name.to_string();
    if section.version.trim().is_empty() {
        return Err(ManifestError::EmptyVersion(name));
    }
    if section.source.trim().is_empty() {
        return Err(ManifestError::EmptySource { name });
    }
    check_placeholders(&name, &section.source)?;

    match section.install {
        InstallKind::Binary | InstallKind::Library => match &section.destination {
            Some(dest) if dest.is_absolute() => {}
            _ => {
                return Err(ManifestError::MissingDestination {
                    name,
                    install: section.install,
                })
            }
        },
        InstallKind::Package => {
            if section.installer.is_none() {
                return Err(ManifestError::MissingInstaller { name });
            }
        }
    }

    let parse = |raw: &str| {
        raw.parse::<Checksum>()
            .map_err(|source| ManifestError::InvalidChecksum {
                name: name.clone(),
                source,
            })
    };
    let pins = match (&section.checksum, section.checksums.is_empty()) {
        (Some(_), false) => {
            return Err(ManifestError::AmbiguousChecksum { name: name.clone() })
        }
        (Some(raw), true) => ChecksumPins::Any(parse(raw)?),
        (None, false) => {
            let mut map = BTreeMap::new();
            for (target, raw) in &section.checksums {
                map.insert(*target, parse(raw)?);
            }
            ChecksumPins::PerTarget(map)
        }
        (None, true) => {
            return Err(ManifestError::MissingChecksum {
                name: name.clone(),
                version: section.version.into_inner(),
            })
        }
    };

    Ok(ArtifactSpec {
        name: section.name,
        version: section.version,
        source: section.source,
        arch_style: section.arch_style,
        install: section.install,
        installer: section.installer,
        destination: section.destination,
        pins,
    })
}

fn check_placeholders(name: &str, template: &str) -> Result<(), ManifestError> {
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| ManifestError::UnterminatedPlaceholder {
                name: name.to_owned(),
            })?;
        let placeholder = &after[..close];
        if !TEMPLATE_PLACEHOLDERS.contains(&placeholder) {
            return Err(ManifestError::UnknownPlaceholder {
                name: name.to_owned(),
                placeholder: placeholder.to_owned(),
            });
        }
        rest = &after[close + 1..];
    }
    Ok(())
}

fn validate_overlay(section: OverlaySection) -> Result<OverlaySpec, ManifestError> {
    if section.version.trim().is_empty() {
        return Err(ManifestError::EmptyOverlayVersion);
    }
    check_placeholders("overlay", &section.base_url)?;
    let mut pins = BTreeMap::new();
    for (archive, raw) in section.checksums {
        let checksum = raw
            .parse::<Checksum>()
            .map_err(|source| ManifestError::InvalidOverlayPin {
                archive: archive.clone(),
                source,
            })?;
        pins.insert(archive, checksum);
    }
    Ok(OverlaySpec {
        version: section.version,
        base_url: section.base_url,
        pins,
    })
}

pub fn parse_manifest_str(input: &str) -> Result<ManifestV1, ManifestError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<ManifestV1, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}

/// Load the container configuration, falling back to defaults when the file is absent.
pub fn load_container_config(path: impl AsRef<Path>) -> Result<ContainerConfig, ManifestError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(ContainerConfig::default());
    }
    let manifest = parse_manifest_file(path)?;
    if manifest.manifest_version != 1 {
        return Err(ManifestError::UnsupportedVersion(manifest.manifest_version));
    }
    Ok(manifest.container_config())
}
