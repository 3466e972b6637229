use super::{json_pretty, resolve_target, CommandResult, EXIT_SUCCESS};
use docket_core::Engine;
use std::path::Path;

pub fn run(manifest: &Path, target: Option<&str>, json: bool) -> CommandResult {
    let engine = Engine::from_manifest_file(manifest)?;
    let plan = engine.resolve(resolve_target(target)?)?;

    if json {
        println!("{}", json_pretty(&plan)?);
    } else if plan.artifacts.is_empty() {
        println!("no artifacts declared");
    } else {
        println!("{:<16} {:<12} {:<8} LOCATION", "NAME", "VERSION", "INSTALL");
        for artifact in &plan.artifacts {
            println!(
                "{:<16} {:<12} {:<8} {}",
                artifact.name.as_str(),
                artifact.version.as_str(),
                artifact.install.to_string(),
                artifact.location
            );
            println!("{:<38} {}", "", artifact.checksum);
        }
    }
    Ok(EXIT_SUCCESS)
}
