use docket_core::{BuildLock, BuildOptions, CoreError, Engine};
use docket_schema::{parse_manifest_str, ArchTarget};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const JBIG2: &[u8] = b"\x7fELF jbig2enc 0.29 for x86_64";
const LIBFOO: &[u8] = b"\x7fELF libfoo shared object";

fn sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn tar_xz(files: &[(&str, &[u8])], links: &[(&str, &str)]) -> Vec<u8> {
    let encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    for (path, target) in links {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, path, target).unwrap();
    }
    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}

/// Mirror directory holding the artifacts and an amd64 overlay bundle.
fn mirror(dir: &Path) {
    fs::write(dir.join("jbig2enc-0.29-x86_64"), JBIG2).unwrap();
    fs::write(dir.join("libfoo.so.1"), LIBFOO).unwrap();
    let archives = [
        (
            "s6-overlay-noarch.tar.xz",
            tar_xz(
                &[
                    ("init", &b"#!/bin/sh\nexec docket init\n"[..]),
                    ("command/with-contenv", &b"#!/bin/sh\n"[..]),
                ],
                &[],
            ),
        ),
        (
            "s6-overlay-x86_64.tar.xz",
            tar_xz(&[("command/s6-svscan", &b"s6-svscan x86_64"[..])], &[]),
        ),
        (
            "s6-overlay-symlinks-noarch.tar.xz",
            tar_xz(&[], &[("usr/bin/with-contenv", "../../command/with-contenv")]),
        ),
        (
            "s6-overlay-symlinks-arch.tar.xz",
            tar_xz(&[], &[("usr/bin/s6-svscan", "../../command/s6-svscan")]),
        ),
    ];
    for (name, data) in archives {
        fs::write(dir.join(format!("{name}.sha256")), format!("{}  {name}\n", sha256(&data))).unwrap();
        fs::write(dir.join(name), data).unwrap();
    }
}

fn manifest(with_overlay: bool) -> String {
    let overlay = if with_overlay {
        "[overlay]\nversion = \"3.1.6.2\"\n"
    } else {
        ""
    };
    format!(
        r#"
manifest_version = 1
{overlay}
[[artifact]]
name = "jbig2enc"
version = "0.29"
source = "https://downloads.example/{{name}}-{{version}}-{{arch}}"
arch_style = "gnu"
install = "binary"
destination = "/usr/local/bin/jbig2"

[artifact.checksums]
amd64 = "sha256:{jbig2}"

[[artifact]]
name = "libfoo"
version = "1"
source = "https://downloads.example/libfoo.so.{{version}}"
install = "library"
destination = "/usr/local/lib/libfoo.so.1"
checksum = "sha256:{libfoo}"
"#,
        jbig2 = sha256(JBIG2),
        libfoo = sha256(LIBFOO),
    )
}

fn engine(manifest: &str, mirror_dir: &Path) -> Engine {
    let validated = parse_manifest_str(manifest).unwrap().validate().unwrap();
    Engine::new(validated).with_mirror(mirror_dir)
}

fn options(root: &Path) -> BuildOptions {
    BuildOptions {
        target: Some(ArchTarget::Amd64),
        root: Some(root.to_path_buf()),
        ..BuildOptions::default()
    }
}

#[test]
fn full_build_installs_everything_and_records_it() {
    let mirror_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    mirror(mirror_dir.path());
    let engine = engine(&manifest(true), mirror_dir.path());

    let result = engine.build(&options(root.path())).unwrap();

    let jbig2 = root.path().join("usr/local/bin/jbig2");
    assert_eq!(fs::read(&jbig2).unwrap(), JBIG2);
    assert_eq!(fs::metadata(&jbig2).unwrap().permissions().mode() & 0o777, 0o755);
    let libfoo = root.path().join("usr/local/lib/libfoo.so.1");
    assert_eq!(fs::metadata(&libfoo).unwrap().permissions().mode() & 0o777, 0o644);

    assert_eq!(fs::read(root.path().join("command/s6-svscan")).unwrap(), b"s6-svscan x86_64");
    assert!(root.path().join("init").is_file());
    assert!(fs::symlink_metadata(root.path().join("usr/bin/with-contenv"))
        .unwrap()
        .file_type()
        .is_symlink());
    assert!(!root.path().join("tmp/docket-downloads").exists());

    let passwd = fs::read_to_string(root.path().join("etc/passwd")).unwrap();
    assert!(passwd.contains("paperless:x:1000:1000:"));
    for volume in ["data", "media", "consume", "export"] {
        assert!(root.path().join("usr/src/paperless").join(volume).is_dir(), "{volume}");
    }

    assert_eq!(result.installed.len(), 2);
    assert_eq!(result.overlay.as_ref().unwrap().archives.len(), 4);
    assert!(result.record_path.starts_with(root.path().join("var/lib/docket")));
    let record = engine.verify(Some(root.path())).unwrap();
    assert_eq!(record.target, ArchTarget::Amd64);
    assert_eq!(record.artifacts.len(), 2);
}

#[test]
fn one_mutated_byte_installs_nothing() {
    let mirror_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    mirror(mirror_dir.path());
    let mut tampered = LIBFOO.to_vec();
    tampered[3] ^= 0x01;
    fs::write(mirror_dir.path().join("libfoo.so.1"), tampered).unwrap();

    let err = engine(&manifest(true), mirror_dir.path())
        .build(&options(root.path()))
        .unwrap_err();

    assert!(err.is_integrity_failure(), "{err}");
    // jbig2enc verified fine but nothing is installed unless everything verifies.
    assert!(!root.path().join("usr/local/bin/jbig2").exists());
    assert!(!root.path().join("usr/local/lib/libfoo.so.1").exists());
    assert!(!root.path().join("init").exists());
    assert!(!root.path().join("var/lib/docket/build.json").exists());
}

#[test]
fn corrupt_overlay_checksum_leaves_no_overlay_files() {
    let mirror_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    mirror(mirror_dir.path());
    fs::write(
        mirror_dir.path().join("s6-overlay-symlinks-arch.tar.xz.sha256"),
        format!("{}  s6-overlay-symlinks-arch.tar.xz\n", "0".repeat(64)),
    )
    .unwrap();

    let err = engine(&manifest(true), mirror_dir.path())
        .build(&options(root.path()))
        .unwrap_err();

    assert!(err.is_integrity_failure(), "{err}");
    for path in ["init", "command", "usr/bin/with-contenv", "usr/bin/s6-svscan"] {
        assert!(!root.path().join(path).exists(), "{path} should not exist");
    }
}

#[test]
fn deleted_overlay_checksum_file_aborts_the_overlay() {
    let mirror_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    mirror(mirror_dir.path());
    fs::remove_file(mirror_dir.path().join("s6-overlay-noarch.tar.xz.sha256")).unwrap();

    assert!(engine(&manifest(true), mirror_dir.path())
        .build(&options(root.path()))
        .is_err());
    assert!(!root.path().join("init").exists());
    assert!(!root.path().join("command").exists());
}

#[test]
fn target_without_pin_is_a_config_error() {
    let mirror_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    mirror(mirror_dir.path());
    let mut opts = options(root.path());
    opts.target = Some(ArchTarget::ArmV7);

    let err = engine(&manifest(false), mirror_dir.path())
        .build(&opts)
        .unwrap_err();

    assert!(err.is_config_error(), "{err}");
    assert!(!root.path().join("usr").exists());
}

#[test]
fn concurrent_build_is_refused() {
    let mirror_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    mirror(mirror_dir.path());
    let _held = BuildLock::acquire(
        &root.path().join("var/lib/docket").join(BuildLock::FILE_NAME),
    )
    .unwrap();

    let err = engine(&manifest(false), mirror_dir.path())
        .build(&options(root.path()))
        .unwrap_err();
    assert!(matches!(err, CoreError::Locked(_)));
}

#[test]
fn verify_catches_a_modified_install() {
    let mirror_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    mirror(mirror_dir.path());
    let engine = engine(&manifest(false), mirror_dir.path());
    let mut opts = options(root.path());
    opts.skip_image = true;
    engine.build(&opts).unwrap();

    fs::write(root.path().join("usr/local/bin/jbig2"), b"replaced").unwrap();
    let err = engine.verify(Some(root.path())).unwrap_err();
    assert!(err.is_integrity_failure());
}
