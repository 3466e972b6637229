use super::{json_pretty, resolve_target, spin_fail, spin_ok, spinner, CommandResult, EXIT_SUCCESS};
use docket_core::{BuildOptions, Engine};
use std::path::{Path, PathBuf};

pub struct BuildArgs {
    pub target: Option<String>,
    pub root: Option<PathBuf>,
    pub mirror: Option<PathBuf>,
    pub skip_overlay: bool,
    pub skip_image: bool,
}

pub fn run(manifest: &Path, args: BuildArgs, json: bool) -> CommandResult {
    let mut engine = Engine::from_manifest_file(manifest)?;
    if let Some(mirror) = &args.mirror {
        engine = engine.with_mirror(mirror);
    }
    let options = BuildOptions {
        target: Some(resolve_target(args.target.as_deref())?),
        root: args.root,
        skip_overlay: args.skip_overlay,
        skip_image: args.skip_image,
    };

    let pb = if json {
        None
    } else {
        Some(spinner("building image..."))
    };
    let result = match engine.build(&options) {
        Ok(r) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "image built");
            }
            r
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(e.into());
        }
    };

    if json {
        let payload = serde_json::json!({
            "target": result.plan.target,
            "artifacts": result.record.artifacts,
            "overlay": result.record.overlay,
            "image": result.image,
            "record": result.record_path,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("target: {}", result.plan.target.platform());
        for artifact in &result.installed {
            let destination = artifact
                .destination
                .as_ref()
                .map_or_else(|| "(package)".to_owned(), |d| d.display().to_string());
            println!(
                "  {} {} -> {destination}",
                artifact.name, artifact.version
            );
        }
        if let Some(overlay) = &result.overlay {
            println!(
                "overlay {}: {} archives, {} entries",
                overlay.version,
                overlay.archives.len(),
                overlay.entries
            );
        }
        println!("record: {}", result.record_path.display());
    }
    Ok(EXIT_SUCCESS)
}
