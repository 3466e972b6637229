//! Declarative inputs for Docket.
//!
//! This crate defines the schema layer: architecture targets (`ArchTarget`),
//! pinned checksums (`Checksum`), the build manifest (`ManifestV1` validated into
//! `BuildManifest`), the container configuration shared by build and run time
//! (`ContainerConfig`), and service unit definitions (`UnitDefinition`).

pub mod arch;
pub mod checksum;
pub mod config;
pub mod manifest;
pub mod types;
pub mod unit;

pub use arch::{ArchError, ArchStyle, ArchTarget};
pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumParseError};
pub use config::{
    AppSection, ContainerConfig, EntrySection, PathsSection, ServiceAccount, VolumesSection,
    DEFAULT_CONFIG_PATH, SERVICE_ACCOUNT_GID, SERVICE_ACCOUNT_NAME, SERVICE_ACCOUNT_UID,
};
pub use manifest::{
    load_container_config, parse_manifest_file, parse_manifest_str, ArtifactSection,
    ArtifactSpec, BuildManifest, ChecksumPins, InstallKind, ManifestError, ManifestV1,
    OverlaySection, OverlaySpec, PackageInstaller,
};
pub use types::{ArtifactName, PinnedVersion, UnitName};
pub use unit::{
    load_units_dir, parse_unit_str, validate_units, Backoff, ReadinessProbe, RestartMode,
    RestartPolicy, TimeoutPolicy, UnitDefinition, UnitError, UnitKind,
};
