use super::{exit_status, json_pretty, load_config, CliError, CommandResult, EXIT_SUCCESS};
use docket_runtime::{current_identity, plan_invocation, IdentityKind, Invocation};
use std::path::Path;
use tracing::debug;

/// Run an application management command as the service account.
///
/// A privileged caller is replaced by the command (so this only returns on
/// failure); the service account runs it as a child and forwards its status.
pub fn run(
    config_path: &Path,
    subcommand: &str,
    args: &[String],
    dry_run: bool,
    json: bool,
) -> CommandResult {
    let config = load_config(config_path)?;
    let invocation = Invocation {
        identity: current_identity(&config.account),
        subcommand: subcommand.to_owned(),
        args: args.to_vec(),
    };
    debug!(
        "manage {subcommand} as {} (uid {})",
        invocation.identity.kind, invocation.identity.uid
    );
    let plan = plan_invocation(&invocation, &config)?;

    if dry_run {
        if json {
            println!("{}", json_pretty(&plan)?);
        } else {
            let drop_to = plan
                .drop_to
                .map_or_else(|| "unchanged".to_owned(), |(uid, gid)| format!("{uid}:{gid}"));
            println!("identity: {}", plan.identity.kind);
            println!("run as:   {drop_to}");
            println!("workdir:  {}", plan.workdir.display());
            println!("command:  {} {}", plan.program, plan.args.join(" "));
        }
        return Ok(EXIT_SUCCESS);
    }

    match plan.identity.kind {
        IdentityKind::Privileged => Err(CliError::from(plan.exec())),
        _ => Ok(exit_status(plan.run()?)),
    }
}
