use super::{exit_status, load_config, CommandResult};
use docket_runtime::run_first_process;
use std::path::Path;
use tracing::info;

/// First-process entry: hand off to the supervision runtime and exit with its status.
pub fn run(config_path: &Path) -> CommandResult {
    let config = load_config(config_path)?;
    let mut args = config.entry.supervisor_args.clone();
    args.push("--config".to_owned());
    args.push(config_path.display().to_string());

    info!(
        "handing off to {} {}",
        config.entry.supervisor_program.display(),
        args.join(" ")
    );
    let code = run_first_process(&config.entry.supervisor_program, &args)?;
    Ok(exit_status(code))
}
