//! Process-supervision overlay bundle.
//!
//! The bundle is four `.tar.xz` archives, each published with a `.sha256` file.
//! Nothing is extracted until all four archives have been downloaded and
//! verified. Extraction goes into a staging directory next to the target root
//! and is merged into the root only once every archive unpacked cleanly.

use crate::checksum::{parse_checksum_file, verify_checksum};
use crate::resolver::render_template;
use crate::source::ArtifactSource;
use crate::FetchError;
use docket_schema::{ArchTarget, OverlaySpec};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayArchive {
    /// Shared binaries and scripts.
    Noarch,
    /// Architecture-specific binaries.
    Arch,
    SymlinksNoarch,
    SymlinksArch,
}

impl OverlayArchive {
    /// Extraction order; later archives overwrite entries of earlier ones.
    pub const EXTRACTION_ORDER: [OverlayArchive; 4] = [
        OverlayArchive::Noarch,
        OverlayArchive::Arch,
        OverlayArchive::SymlinksNoarch,
        OverlayArchive::SymlinksArch,
    ];

    pub fn file_name(self, target: ArchTarget) -> String {
        match self {
            Self::Noarch => "s6-overlay-noarch.tar.xz".to_owned(),
            Self::Arch => format!("s6-overlay-{}.tar.xz", target.gnu_name()),
            Self::SymlinksNoarch => "s6-overlay-symlinks-noarch.tar.xz".to_owned(),
            Self::SymlinksArch => "s6-overlay-symlinks-arch.tar.xz".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OverlayReport {
    pub version: String,
    pub target: ArchTarget,
    /// Archive file names with their verified `sha256:` checksums, in extraction order.
    pub archives: Vec<(String, String)>,
    pub entries: usize,
}

/// Removes the download directory however the fetch ends.
struct DownloadDir(PathBuf);

impl Drop for DownloadDir {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = fs::remove_dir_all(&self.0) {
                tracing::warn!("failed to remove {}: {e}", self.0.display());
            }
        }
    }
}

struct Downloaded {
    name: String,
    path: PathBuf,
    checksum: String,
}

/// Download, verify and unpack the overlay bundle onto `root`.
pub fn fetch_overlay(
    spec: &OverlaySpec,
    target: ArchTarget,
    source: &dyn ArtifactSource,
    download_dir: &Path,
    root: &Path,
) -> Result<OverlayReport, FetchError> {
    let base = render_template(&spec.base_url, "s6-overlay", &spec.version, target.gnu_name());
    let base = base.trim_end_matches('/');

    if download_dir.exists() {
        fs::remove_dir_all(download_dir)?;
    }
    fs::create_dir_all(download_dir)?;
    let guard = DownloadDir(download_dir.to_path_buf());

    let mut downloaded = Vec::with_capacity(OverlayArchive::EXTRACTION_ORDER.len());
    for archive in OverlayArchive::EXTRACTION_ORDER {
        let name = archive.file_name(target);
        let url = format!("{base}/{name}");
        let data = source.fetch(&url)?;
        let sum_name = format!("{name}.sha256");
        let sum = source.fetch(&format!("{url}.sha256"))?;
        let path = guard.0.join(&name);
        fs::write(&path, &data)?;
        fs::write(guard.0.join(&sum_name), &sum)?;
        tracing::debug!("downloaded {name} ({} bytes)", data.len());
        downloaded.push((name, sum_name, path));
    }

    // Verify all four before touching the root.
    let mut verified = Vec::with_capacity(downloaded.len());
    for (name, sum_name, path) in downloaded {
        let published = parse_checksum_file(&sum_name, &fs::read(guard.0.join(&sum_name))?, &name)?;
        let data = fs::read(&path)?;
        verify_checksum(&name, &published, &data)?;
        if let Some(pin) = spec.pins.get(&name) {
            verify_checksum(&name, pin, &data)?;
        }
        tracing::debug!("verified {name}");
        verified.push(Downloaded {
            name,
            path,
            checksum: published.to_string(),
        });
    }

    fs::create_dir_all(root)?;
    let staging = tempfile::Builder::new()
        .prefix(".docket-overlay-")
        .tempdir_in(root)?;
    for archive in &verified {
        unpack_xz(&archive.path, staging.path()).map_err(|e| FetchError::Extract {
            archive: archive.name.clone(),
            message: e.to_string(),
        })?;
        tracing::debug!("unpacked {}", archive.name);
    }
    let entries = merge_tree(staging.path(), root)?;
    drop(guard);

    tracing::info!(
        version = %spec.version,
        target = %target,
        "overlay unpacked onto {} ({entries} entries)",
        root.display()
    );
    Ok(OverlayReport {
        version: spec.version.to_string(),
        target,
        archives: verified.into_iter().map(|a| (a.name, a.checksum)).collect(),
        entries,
    })
}

fn unpack_xz(archive: &Path, dest: &Path) -> std::io::Result<()> {
    let file = fs::File::open(archive)?;
    let decoder = xz2::read::XzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(dest)
}

/// Move every entry of `from` into `to`, replacing files and symlinks that already exist.
fn merge_tree(from: &Path, to: &Path) -> Result<usize, FetchError> {
    let mut moved = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            match fs::symlink_metadata(&dst) {
                Ok(meta) if meta.is_dir() => {
                    moved += merge_tree(&src, &dst)?;
                    continue;
                }
                Ok(_) => fs::remove_file(&dst)?,
                Err(_) => {}
            }
            fs::rename(&src, &dst)?;
            moved += 1;
        } else {
            match fs::symlink_metadata(&dst) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&dst)?,
                Ok(_) => fs::remove_file(&dst)?,
                Err(_) => {}
            }
            fs::rename(&src, &dst)?;
            moved += 1;
        }
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_checksum;
    use docket_schema::{ChecksumAlgorithm, PinnedVersion};
    use std::collections::{BTreeMap, HashMap};
    use std::io::Write;
    use std::sync::Mutex;

    struct MapSource {
        files: HashMap<String, Vec<u8>>,
        requested: Mutex<Vec<String>>,
    }

    impl ArtifactSource for MapSource {
        fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError> {
            self.requested.lock().unwrap().push(location.to_owned());
            self.files
                .get(location)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(location.to_owned()))
        }
    }

    enum Entry<'a> {
        File(&'a str, &'a [u8]),
        Symlink(&'a str, &'a str),
    }

    fn tar_xz(entries: &[Entry<'_>]) -> Vec<u8> {
        let encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        let mut builder = tar::Builder::new(encoder);
        for entry in entries {
            let mut header = tar::Header::new_gnu();
            match entry {
                Entry::File(path, data) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(data.len() as u64);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder.append_data(&mut header, path, *data).unwrap();
                }
                Entry::Symlink(path, target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    builder.append_link(&mut header, path, target).unwrap();
                }
            }
        }
        let mut encoder = builder.into_inner().unwrap();
        encoder.flush().unwrap();
        encoder.finish().unwrap()
    }

    const BASE: &str = "https://overlay.example/v3.1.6.2";

    fn spec() -> OverlaySpec {
        OverlaySpec {
            version: PinnedVersion::new("3.1.6.2"),
            base_url: "https://overlay.example/v{version}".to_owned(),
            pins: BTreeMap::new(),
        }
    }

    fn bundle(target: ArchTarget) -> HashMap<String, Vec<u8>> {
        let archives = [
            (
                OverlayArchive::Noarch,
                tar_xz(&[
                    Entry::File("command/with-contenv", b"#!/bin/sh\n"),
                    Entry::File("init", b"noarch-init"),
                ]),
            ),
            (
                OverlayArchive::Arch,
                tar_xz(&[Entry::File("command/s6-svscan", b"arch-binary")]),
            ),
            (
                OverlayArchive::SymlinksNoarch,
                tar_xz(&[Entry::Symlink("usr/bin/with-contenv", "../../command/with-contenv")]),
            ),
            (
                OverlayArchive::SymlinksArch,
                tar_xz(&[Entry::Symlink("usr/bin/s6-svscan", "../../command/s6-svscan")]),
            ),
        ];
        let mut files = HashMap::new();
        for (archive, data) in archives {
            let name = archive.file_name(target);
            let hex = compute_checksum(ChecksumAlgorithm::Sha256, &data);
            let hex = hex.trim_start_matches("sha256:");
            files.insert(
                format!("{BASE}/{name}.sha256"),
                format!("{hex}  {name}\n").into_bytes(),
            );
            files.insert(format!("{BASE}/{name}"), data);
        }
        files
    }

    fn source(files: HashMap<String, Vec<u8>>) -> MapSource {
        MapSource {
            files,
            requested: Mutex::new(Vec::new()),
        }
    }

    fn is_empty_dir(path: &Path) -> bool {
        fs::read_dir(path).unwrap().next().is_none()
    }

    #[test]
    fn archive_names_follow_target() {
        assert_eq!(
            OverlayArchive::Arch.file_name(ArchTarget::Amd64),
            "s6-overlay-x86_64.tar.xz"
        );
        assert_eq!(
            OverlayArchive::Arch.file_name(ArchTarget::Arm64),
            "s6-overlay-aarch64.tar.xz"
        );
        assert_eq!(
            OverlayArchive::Arch.file_name(ArchTarget::ArmV7),
            "s6-overlay-armhf.tar.xz"
        );
    }

    #[test]
    fn unpacks_all_archives_and_cleans_downloads() {
        let work = tempfile::tempdir().unwrap();
        let root = work.path().join("root");
        let downloads = work.path().join("downloads");
        let src = source(bundle(ArchTarget::Amd64));

        let report = fetch_overlay(&spec(), ArchTarget::Amd64, &src, &downloads, &root).unwrap();

        assert_eq!(report.archives.len(), 4);
        assert_eq!(report.archives[0].0, "s6-overlay-noarch.tar.xz");
        assert_eq!(report.archives[1].0, "s6-overlay-x86_64.tar.xz");
        assert_eq!(fs::read(root.join("command/s6-svscan")).unwrap(), b"arch-binary");
        assert_eq!(fs::read(root.join("init")).unwrap(), b"noarch-init");
        let link = fs::read_link(root.join("usr/bin/s6-svscan")).unwrap();
        assert_eq!(link, PathBuf::from("../../command/s6-svscan"));
        assert!(!downloads.exists());
        let leftovers: Vec<_> = fs::read_dir(&root)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".docket-overlay-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_checksum_file_leaves_root_untouched() {
        let work = tempfile::tempdir().unwrap();
        let root = work.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let downloads = work.path().join("downloads");
        let mut files = bundle(ArchTarget::Arm64);
        files.insert(
            format!("{BASE}/s6-overlay-symlinks-arch.tar.xz.sha256"),
            b"zzzz  s6-overlay-symlinks-arch.tar.xz\n".to_vec(),
        );

        let err = fetch_overlay(&spec(), ArchTarget::Arm64, &source(files), &downloads, &root)
            .unwrap_err();

        assert!(matches!(err, FetchError::MalformedChecksumFile { .. }));
        assert!(is_empty_dir(&root));
        assert!(!downloads.exists());
    }

    #[test]
    fn mismatching_archive_leaves_root_untouched() {
        let work = tempfile::tempdir().unwrap();
        let root = work.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let mut files = bundle(ArchTarget::Amd64);
        let key = format!("{BASE}/s6-overlay-x86_64.tar.xz");
        let mut tampered = files[&key].clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        files.insert(key, tampered);

        let err = fetch_overlay(
            &spec(),
            ArchTarget::Amd64,
            &source(files),
            &work.path().join("dl"),
            &root,
        )
        .unwrap_err();

        assert!(matches!(err, FetchError::ChecksumMismatch { .. }));
        assert!(is_empty_dir(&root));
    }

    #[test]
    fn missing_checksum_file_aborts() {
        let work = tempfile::tempdir().unwrap();
        let root = work.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let mut files = bundle(ArchTarget::Amd64);
        files.remove(&format!("{BASE}/s6-overlay-noarch.tar.xz.sha256"));

        let err = fetch_overlay(
            &spec(),
            ArchTarget::Amd64,
            &source(files),
            &work.path().join("dl"),
            &root,
        )
        .unwrap_err();

        assert!(matches!(err, FetchError::NotFound(_)));
        assert!(is_empty_dir(&root));
    }

    #[test]
    fn manifest_pin_is_enforced_on_top_of_published_checksum() {
        let work = tempfile::tempdir().unwrap();
        let root = work.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let mut overlay = spec();
        overlay.pins.insert(
            "s6-overlay-noarch.tar.xz".to_owned(),
            docket_schema::Checksum::sha256(&"a".repeat(64)).unwrap(),
        );

        let err = fetch_overlay(
            &overlay,
            ArchTarget::Amd64,
            &source(bundle(ArchTarget::Amd64)),
            &work.path().join("dl"),
            &root,
        )
        .unwrap_err();

        assert!(matches!(err, FetchError::ChecksumMismatch { ref name, .. } if name == "s6-overlay-noarch.tar.xz"));
        assert!(is_empty_dir(&root));
    }

    #[test]
    fn later_archives_replace_earlier_entries() {
        let work = tempfile::tempdir().unwrap();
        let root = work.path().join("root");
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/with-contenv"), b"stale file").unwrap();

        fetch_overlay(
            &spec(),
            ArchTarget::Amd64,
            &source(bundle(ArchTarget::Amd64)),
            &work.path().join("dl"),
            &root,
        )
        .unwrap();

        let meta = fs::symlink_metadata(root.join("usr/bin/with-contenv")).unwrap();
        assert!(meta.file_type().is_symlink());
    }
}
