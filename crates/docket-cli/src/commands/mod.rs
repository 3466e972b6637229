pub mod build;
pub mod completions;
pub mod init;
pub mod manage;
pub mod resolve;
pub mod supervise;
pub mod units;
pub mod verify;

use docket_core::{ContainerState, CoreError, UnitState};
use docket_runtime::{RuntimeError, EXIT_UNKNOWN_IDENTITY};
use docket_schema::{ArchTarget, ContainerConfig, ManifestError, UnitError};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_INTEGRITY_ERROR: u8 = 3;
pub const EXIT_NOPERM: u8 = EXIT_UNKNOWN_IDENTITY as u8;

/// A failed command: the message for stderr and the process exit code.
#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
}

impl CliError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_FAILURE,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        let code = if err.is_config_error() {
            EXIT_CONFIG_ERROR
        } else if err.is_integrity_failure() {
            EXIT_INTEGRITY_ERROR
        } else if matches!(err, CoreError::Runtime(RuntimeError::UnknownIdentity { .. })) {
            EXIT_NOPERM
        } else {
            EXIT_FAILURE
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl From<ManifestError> for CliError {
    fn from(err: ManifestError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<UnitError> for CliError {
    fn from(err: UnitError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<RuntimeError> for CliError {
    fn from(err: RuntimeError) -> Self {
        CoreError::from(err).into()
    }
}

pub type CommandResult = Result<u8, CliError>;

/// Clamp a child or container exit status into a process exit code.
pub fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_FAILURE)
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CliError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CliError::failure(format!("JSON serialization failed: {e}")))
}

pub fn load_config(path: &Path) -> Result<ContainerConfig, CliError> {
    Ok(docket_schema::load_container_config(path)?)
}

/// `--target`, then Docker's `TARGETARCH`/`TARGETVARIANT` build arguments, then the host.
pub fn resolve_target(target: Option<&str>) -> Result<ArchTarget, CliError> {
    let parsed = match target {
        Some(platform) => ArchTarget::parse_platform(platform),
        None => match std::env::var("TARGETARCH") {
            Ok(arch) if !arch.is_empty() => {
                let variant = std::env::var("TARGETVARIANT").unwrap_or_default();
                ArchTarget::parse(&arch, &variant)
            }
            _ => ArchTarget::host(),
        },
    };
    parsed.map_err(|e| CoreError::from(e).into())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_unit_state(state: UnitState) -> String {
    use console::Style;
    let text = state.to_string();
    match state {
        UnitState::Ready | UnitState::Running | UnitState::Done => {
            Style::new().green().apply_to(text).to_string()
        }
        UnitState::Starting | UnitState::Restarting => {
            Style::new().cyan().apply_to(text).to_string()
        }
        UnitState::Skipped | UnitState::Stopping => Style::new().yellow().apply_to(text).to_string(),
        UnitState::Failed => Style::new().red().bold().apply_to(text).to_string(),
        UnitState::Init | UnitState::Stopped => Style::new().dim().apply_to(text).to_string(),
    }
}

pub fn colorize_container_state(state: ContainerState) -> String {
    use console::Style;
    let text = state.to_string();
    match state {
        ContainerState::Running | ContainerState::Stopped => {
            Style::new().green().apply_to(text).to_string()
        }
        ContainerState::Failed => Style::new().red().bold().apply_to(text).to_string(),
        ContainerState::Starting | ContainerState::Stopping => {
            Style::new().cyan().apply_to(text).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_fetch::FetchError;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_CONFIG_ERROR,
            EXIT_INTEGRITY_ERROR,
            EXIT_NOPERM,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(EXIT_NOPERM, 77);
    }

    #[test]
    fn manifest_errors_map_to_config_exit() {
        let err: CliError = ManifestError::UnsupportedVersion(2).into();
        assert_eq!(err.code, EXIT_CONFIG_ERROR);
        assert!(err.message.contains("manifest_version"));
    }

    #[test]
    fn integrity_failures_map_to_integrity_exit() {
        let err: CliError = CoreError::Record("artifact 'qpdf' mismatch".to_owned()).into();
        assert_eq!(err.code, EXIT_INTEGRITY_ERROR);
    }

    #[test]
    fn unknown_identity_maps_to_noperm() {
        let err: CliError = RuntimeError::UnknownIdentity {
            uid: 4242,
            name: "mallory".to_owned(),
        }
        .into();
        assert_eq!(err.code, EXIT_NOPERM);
    }

    #[test]
    fn other_errors_are_plain_failures() {
        let err: CliError =
            CoreError::from(FetchError::Http("connection refused".to_owned())).into();
        assert_eq!(err.code, EXIT_FAILURE);
    }

    #[test]
    fn exit_status_clamps_out_of_range_codes() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(137), 137);
        assert_eq!(exit_status(-1), EXIT_FAILURE);
        assert_eq!(exit_status(300), EXIT_FAILURE);
    }

    #[test]
    fn explicit_target_wins() {
        assert_eq!(resolve_target(Some("linux/arm/v7")).unwrap(), ArchTarget::ArmV7);
        assert_eq!(resolve_target(Some("arm64")).unwrap(), ArchTarget::Arm64);
    }

    #[test]
    fn unsupported_target_is_a_config_error() {
        let err = resolve_target(Some("linux/s390x")).unwrap_err();
        assert_eq!(err.code, EXIT_CONFIG_ERROR);
    }

    #[test]
    fn colorized_states_keep_their_text() {
        assert!(colorize_unit_state(UnitState::Failed).contains("FAILED"));
        assert!(colorize_container_state(ContainerState::Running).contains("RUNNING"));
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
