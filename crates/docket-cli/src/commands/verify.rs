use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use docket_core::Engine;
use std::path::Path;

pub fn run(manifest: &Path, root: Option<&Path>, json: bool) -> CommandResult {
    let engine = Engine::from_manifest_file(manifest)?;
    let record = engine.verify(root)?;

    if json {
        let payload = serde_json::json!({
            "target": record.target,
            "built_at": record.built_at,
            "verified": record.artifacts.iter().map(|a| &a.name).collect::<Vec<_>>(),
            "overlay": record.overlay.as_ref().map(|o| &o.version),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "build record: {} built {}",
            record.target.platform(),
            record.built_at
        );
        for artifact in &record.artifacts {
            println!("  ok {} {}", artifact.name, artifact.version);
        }
    }
    Ok(EXIT_SUCCESS)
}
