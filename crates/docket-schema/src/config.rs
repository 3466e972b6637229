//! Container configuration shared by build-time assembly and run-time dispatch.
//!
//! The service account, the filesystem layout and the application entry points
//! are one explicit value. Build steps and the run-time gateway both receive it
//! instead of reading ambient environment state, so each can be exercised
//! against a temporary root and an arbitrary identity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the fixed, non-privileged account that runs all application code.
pub const SERVICE_ACCOUNT_NAME: &str = "paperless";
pub const SERVICE_ACCOUNT_UID: u32 = 1000;
pub const SERVICE_ACCOUNT_GID: u32 = 1000;

/// Default location of the docket configuration inside the image.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/docket/docket.toml";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceAccount {
    #[serde(default = "default_account_name")]
    pub name: String,
    #[serde(default = "default_account_uid")]
    pub uid: u32,
    #[serde(default = "default_account_gid")]
    pub gid: u32,
    #[serde(default = "default_account_home")]
    pub home: PathBuf,
}

impl Default for ServiceAccount {
    fn default() -> Self {
        Self {
            name: default_account_name(),
            uid: default_account_uid(),
            gid: default_account_gid(),
            home: default_account_home(),
        }
    }
}

fn default_account_name() -> String {
    SERVICE_ACCOUNT_NAME.to_owned()
}

fn default_account_uid() -> u32 {
    SERVICE_ACCOUNT_UID
}

fn default_account_gid() -> u32 {
    SERVICE_ACCOUNT_GID
}

fn default_account_home() -> PathBuf {
    PathBuf::from("/usr/src/paperless")
}

/// The four persistent volume mount points.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VolumesSection {
    #[serde(default = "default_data_dir")]
    pub data: PathBuf,
    #[serde(default = "default_media_dir")]
    pub media: PathBuf,
    #[serde(default = "default_consume_dir")]
    pub consume: PathBuf,
    #[serde(default = "default_export_dir")]
    pub export: PathBuf,
}

impl Default for VolumesSection {
    fn default() -> Self {
        Self {
            data: default_data_dir(),
            media: default_media_dir(),
            consume: default_consume_dir(),
            export: default_export_dir(),
        }
    }
}

impl VolumesSection {
    /// Mount points in a stable order: data, media, consume, export.
    pub fn all(&self) -> [(&'static str, &Path); 4] {
        [
            ("data", self.data.as_path()),
            ("media", self.media.as_path()),
            ("consume", self.consume.as_path()),
            ("export", self.export.as_path()),
        ]
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/usr/src/paperless/data")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("/usr/src/paperless/media")
}

fn default_consume_dir() -> PathBuf {
    PathBuf::from("/usr/src/paperless/consume")
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("/usr/src/paperless/export")
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PathsSection {
    /// Root of the image filesystem that build steps write into.
    #[serde(default = "default_image_root")]
    pub image_root: PathBuf,
    /// Fixed root location the supervision overlay is unpacked onto.
    #[serde(default = "default_overlay_root")]
    pub overlay_root: PathBuf,
    #[serde(default = "default_units_dir")]
    pub units_dir: PathBuf,
    /// Build lock and build record.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Scratch space for downloads; removed after every build step.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default)]
    pub volumes: VolumesSection,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            image_root: default_image_root(),
            overlay_root: default_overlay_root(),
            units_dir: default_units_dir(),
            state_dir: default_state_dir(),
            download_dir: default_download_dir(),
            volumes: VolumesSection::default(),
        }
    }
}

fn default_image_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_overlay_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_units_dir() -> PathBuf {
    PathBuf::from("/etc/docket/units")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/docket")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/tmp/docket-downloads")
}

/// How operator management commands reach the application.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AppSection {
    #[serde(default = "default_manage_program")]
    pub manage_program: String,
    #[serde(default = "default_manage_args")]
    pub manage_args: Vec<String>,
    #[serde(default = "default_app_workdir")]
    pub workdir: PathBuf,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            manage_program: default_manage_program(),
            manage_args: default_manage_args(),
            workdir: default_app_workdir(),
            environment: BTreeMap::new(),
        }
    }
}

fn default_manage_program() -> String {
    "python3".to_owned()
}

fn default_manage_args() -> Vec<String> {
    vec!["manage.py".to_owned()]
}

fn default_app_workdir() -> PathBuf {
    PathBuf::from("/usr/src/paperless/src")
}

/// Command the first process hands control to.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EntrySection {
    #[serde(default = "default_supervisor_program")]
    pub supervisor_program: PathBuf,
    #[serde(default = "default_supervisor_args")]
    pub supervisor_args: Vec<String>,
}

impl Default for EntrySection {
    fn default() -> Self {
        Self {
            supervisor_program: default_supervisor_program(),
            supervisor_args: default_supervisor_args(),
        }
    }
}

fn default_supervisor_program() -> PathBuf {
    PathBuf::from("/usr/local/bin/docket")
}

fn default_supervisor_args() -> Vec<String> {
    vec!["supervise".to_owned()]
}

/// Everything build-time and run-time components need to know about the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub account: ServiceAccount,
    pub paths: PathsSection,
    pub app: AppSection,
    pub entry: EntrySection,
}

impl ContainerConfig {
    /// Resolve an absolute in-image path against an alternate root.
    ///
    /// `/usr/local/bin/qpdf` under root `/tmp/img` becomes `/tmp/img/usr/local/bin/qpdf`.
    pub fn in_root(root: &Path, path: &Path) -> PathBuf {
        root.join(path.strip_prefix("/").unwrap_or(path))
    }

    pub fn image_path(&self, path: &Path) -> PathBuf {
        Self::in_root(&self.paths.image_root, path)
    }
}
