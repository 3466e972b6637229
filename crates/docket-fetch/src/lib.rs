//! Build-time fetching for Docket.
//!
//! This crate resolves pinned artifacts for an architecture target, downloads
//! them from http(s), `file://` or a local mirror, verifies every byte against
//! the pinned checksum, installs verified artifacts into the image root, and
//! fetches and unpacks the process-supervision overlay bundle.

pub mod checksum;
pub mod image;
pub mod installer;
pub mod overlay;
pub mod resolver;
pub mod source;

pub use checksum::{compute_checksum, digest_hex, parse_checksum_file, verify_checksum};
pub use image::{prepare_image, ImagePreparation};
pub use installer::{install, CommandRunner, InstalledArtifact, PackageRunner};
pub use overlay::{fetch_overlay, OverlayArchive, OverlayReport};
pub use resolver::{
    fetch_and_verify, render_template, resolve_all, resolve_artifact, BuildPlan,
    ResolvedArtifact, VerifiedArtifact,
};
pub use source::{ArtifactSource, FileSource, HttpSource, MirrorSource, SourceRouter};

use docket_schema::ArchTarget;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported source location '{0}' (expected http://, https://, file:// or an absolute path)")]
    UnsupportedSource(String),
    #[error("artifact '{name}' has no checksum pinned for {target}")]
    MissingPin { name: String, target: ArchTarget },
    #[error("checksum mismatch for '{name}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("malformed checksum file '{file}': {reason}")]
    MalformedChecksumFile { file: String, reason: String },
    #[error("installer {installer} failed for '{name}': {message}")]
    InstallerFailed {
        name: String,
        installer: String,
        message: String,
    },
    #[error("failed to extract '{archive}': {message}")]
    Extract { archive: String, message: String },
    #[error("image preparation failed: {0}")]
    Image(String),
}

impl FetchError {
    /// Whether this error means downloaded content could not be trusted.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::MalformedChecksumFile { .. }
        )
    }
}
