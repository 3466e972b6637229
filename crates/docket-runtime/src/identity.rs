use docket_schema::ServiceAccount;
use serde::Serialize;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityKind {
    Privileged,
    ServiceAccount,
    Unknown,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Privileged => "privileged",
            Self::ServiceAccount => "service-account",
            Self::Unknown => "unknown",
        })
    }
}

/// Who is invoking a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub kind: IdentityKind,
    pub uid: u32,
    pub gid: u32,
    pub name: String,
}

/// uid 0 is privileged, the service account's uid is the service account, anything else is unknown.
pub fn classify(uid: u32, gid: u32, name: &str, account: &ServiceAccount) -> Identity {
    let kind = if uid == 0 {
        IdentityKind::Privileged
    } else if uid == account.uid {
        IdentityKind::ServiceAccount
    } else {
        IdentityKind::Unknown
    };
    Identity {
        kind,
        uid,
        gid,
        name: name.to_owned(),
    }
}

/// Safe wrapper around libc::getuid().
#[allow(unsafe_code)]
fn current_uid() -> u32 {
    // SAFETY: getuid() is always safe, no arguments, no side effects, cannot fail.
    unsafe { libc::getuid() }
}

/// Safe wrapper around libc::getgid().
#[allow(unsafe_code)]
fn current_gid() -> u32 {
    // SAFETY: getgid() is always safe, no arguments, no side effects, cannot fail.
    unsafe { libc::getgid() }
}

/// Classify the calling process.
pub fn current_identity(account: &ServiceAccount) -> Identity {
    let uid = current_uid();
    let gid = current_gid();
    let name = user_name_for(Path::new("/etc/passwd"), uid).unwrap_or_else(|| uid.to_string());
    classify(uid, gid, &name, account)
}

/// Look up a user name by uid in a passwd-format file.
pub fn user_name_for(passwd: &Path, uid: u32) -> Option<String> {
    let content = std::fs::read_to_string(passwd).ok()?;
    let uid = uid.to_string();
    content.lines().find_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let entry_uid = fields.nth(1)?;
        (entry_uid == uid).then(|| name.to_owned())
    })
}
