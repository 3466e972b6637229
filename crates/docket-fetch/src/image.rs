//! Service account entries and volume mount points in the image filesystem.

use crate::FetchError;
use docket_schema::{ContainerConfig, ServiceAccount};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImagePreparation {
    pub passwd_entry_added: bool,
    pub group_entry_added: bool,
    pub directories: Vec<PathBuf>,
    pub ownership_applied: bool,
}

/// Safe wrapper around libc::geteuid().
#[allow(unsafe_code)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid() takes no arguments and cannot fail.
    unsafe { libc::geteuid() }
}

/// Add the service account to the image and create its home and volume directories.
///
/// Ownership is only changed when running as root; unprivileged builds into a
/// scratch root leave ownership to the caller.
pub fn prepare_image(config: &ContainerConfig, root: &Path) -> Result<ImagePreparation, FetchError> {
    let account = &config.account;
    let mut prep = ImagePreparation {
        passwd_entry_added: ensure_passwd_entry(account, root)?,
        group_entry_added: ensure_group_entry(account, root)?,
        ..ImagePreparation::default()
    };

    let mut dirs: Vec<&Path> = vec![account.home.as_path()];
    dirs.extend(config.paths.volumes.all().iter().map(|(_, p)| *p));
    let chown = effective_uid() == 0;
    for dir in dirs {
        let in_root = ContainerConfig::in_root(root, dir);
        fs::create_dir_all(&in_root)?;
        if chown {
            std::os::unix::fs::chown(&in_root, Some(account.uid), Some(account.gid))?;
        }
        prep.directories.push(dir.to_path_buf());
    }
    prep.ownership_applied = chown;

    tracing::info!(
        account = %account.name,
        uid = account.uid,
        gid = account.gid,
        "image prepared ({} directories)",
        prep.directories.len()
    );
    Ok(prep)
}

fn ensure_passwd_entry(account: &ServiceAccount, root: &Path) -> Result<bool, FetchError> {
    let passwd_path = root.join("etc/passwd");
    let existing = read_or_empty(&passwd_path)?;
    if let Some(uid) = field_for(&existing, &account.name, 2) {
        if uid != account.uid.to_string() {
            return Err(FetchError::Image(format!(
                "user '{}' already exists with uid {uid}, expected {}",
                account.name, account.uid
            )));
        }
        return Ok(false);
    }
    let entry = format!(
        "{}:x:{}:{}::{}:/usr/sbin/nologin\n",
        account.name,
        account.uid,
        account.gid,
        account.home.display()
    );
    append_line(&passwd_path, existing, &entry)?;
    Ok(true)
}

fn ensure_group_entry(account: &ServiceAccount, root: &Path) -> Result<bool, FetchError> {
    let group_path = root.join("etc/group");
    let existing = read_or_empty(&group_path)?;
    if let Some(gid) = field_for(&existing, &account.name, 2) {
        if gid != account.gid.to_string() {
            return Err(FetchError::Image(format!(
                "group '{}' already exists with gid {gid}, expected {}",
                account.name, account.gid
            )));
        }
        return Ok(false);
    }
    let entry = format!("{}:x:{}:\n", account.name, account.gid);
    append_line(&group_path, existing, &entry)?;
    Ok(true)
}

fn read_or_empty(path: &Path) -> Result<String, FetchError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Field `index` of the colon-separated line whose first field is `name`.
fn field_for(content: &str, name: &str, index: usize) -> Option<String> {
    content
        .lines()
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| fields.first() == Some(&name))
        .and_then(|fields| fields.get(index).map(|s| (*s).to_owned()))
}

fn append_line(path: &Path, mut content: String, line: &str) -> Result<(), FetchError> {
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    crate::installer::write_atomic(path, content.as_bytes(), 0o644)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_config(root: &Path) -> ContainerConfig {
        let mut config = ContainerConfig::default();
        config.paths.image_root = root.to_path_buf();
        config
    }

    #[test]
    fn adds_account_and_volumes() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/passwd"), "root:x:0:0:root:/root:/bin/bash").unwrap();

        let prep = prepare_image(&scratch_config(root.path()), root.path()).unwrap();

        assert!(prep.passwd_entry_added);
        assert!(prep.group_entry_added);
        let passwd = fs::read_to_string(root.path().join("etc/passwd")).unwrap();
        assert!(passwd.starts_with("root:x:0:0:root:/root:/bin/bash\n"));
        assert!(passwd.contains("paperless:x:1000:1000::/usr/src/paperless:/usr/sbin/nologin\n"));
        let group = fs::read_to_string(root.path().join("etc/group")).unwrap();
        assert_eq!(group, "paperless:x:1000:\n");
        for volume in ["data", "media", "consume", "export"] {
            assert!(root.path().join("usr/src/paperless").join(volume).is_dir());
        }
        assert_eq!(prep.directories.len(), 5);
    }

    #[test]
    fn is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let config = scratch_config(root.path());
        prepare_image(&config, root.path()).unwrap();
        let second = prepare_image(&config, root.path()).unwrap();
        assert!(!second.passwd_entry_added);
        assert!(!second.group_entry_added);
        let passwd = fs::read_to_string(root.path().join("etc/passwd")).unwrap();
        assert_eq!(passwd.matches("paperless:").count(), 1);
    }

    #[test]
    fn conflicting_uid_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(
            root.path().join("etc/passwd"),
            "paperless:x:1500:1500::/home/paperless:/bin/sh\n",
        )
        .unwrap();
        let err = prepare_image(&scratch_config(root.path()), root.path()).unwrap_err();
        assert!(err.to_string().contains("uid 1500"));
    }

    #[test]
    fn field_lookup_matches_whole_name() {
        let content = "paperless-ngx:x:2000:2000::/:/bin/sh\npaperless:x:1000:1000::/:/bin/sh\n";
        assert_eq!(field_for(content, "paperless", 2).as_deref(), Some("1000"));
        assert_eq!(field_for(content, "nobody", 2), None);
    }
}
