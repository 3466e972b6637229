use super::{
    colorize_container_state, colorize_unit_state, exit_status, json_pretty, load_config,
    CliError, CommandResult,
};
use docket_core::{RunAs, SupervisionReport, Supervisor};
use docket_runtime::{current_identity, IdentityKind, ProcessLauncher};
use docket_schema::load_units_dir;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Resolves on SIGTERM or SIGINT.
async fn termination() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => info!("received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            }
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

pub fn run(config_path: &Path, units_dir: Option<&Path>, json: bool) -> CommandResult {
    let config = load_config(config_path)?;
    let units_dir = units_dir.unwrap_or(&config.paths.units_dir);
    let units = load_units_dir(units_dir)?;

    let identity = current_identity(&config.account);
    let run_as = (identity.kind == IdentityKind::Privileged).then(|| RunAs {
        uid: config.account.uid,
        gid: config.account.gid,
        user: config.account.name.clone(),
        home: config.account.home.clone(),
    });
    if run_as.is_some() {
        info!("units run as {} ({})", config.account.name, config.account.uid);
    }
    let supervisor =
        Supervisor::new(units, Arc::new(ProcessLauncher))?.with_identity(run_as);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::failure(format!("failed to start async runtime: {e}")))?;
    let report = runtime.block_on(supervisor.run(termination()));

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(exit_status(report.exit_code))
}

fn print_report(report: &SupervisionReport) {
    if let Some(fatal) = &report.fatal {
        eprintln!("container failed: {fatal}");
    }
    eprintln!(
        "container {} (exit {})",
        colorize_container_state(report.state),
        report.exit_code
    );
    for unit in &report.units {
        let last = unit
            .last_exit
            .map_or_else(String::new, |outcome| format!(" last exit: {outcome}"));
        eprintln!(
            "  {:<16} {} launches: {} restarts: {}{last}",
            unit.name.as_str(),
            colorize_unit_state(unit.state),
            unit.launches,
            unit.restarts
        );
    }
}
