use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use docket_core::UnitGraph;
use docket_schema::{load_units_dir, UnitName};
use std::path::Path;

/// Validate the unit directory and show the start order.
pub fn run(units_dir: &Path, json: bool) -> CommandResult {
    let graph = UnitGraph::build(load_units_dir(units_dir)?)?;

    if json {
        let units: Vec<_> = graph
            .units()
            .map(|unit| {
                serde_json::json!({
                    "name": unit.name,
                    "kind": unit.kind,
                    "depends_on": unit.depends_on,
                    "readiness": unit.readiness,
                    "on_timeout": unit.on_timeout,
                    "restart": unit.restart.mode,
                })
            })
            .collect();
        println!("{}", json_pretty(&units)?);
    } else if graph.is_empty() {
        println!("no units in {}", units_dir.display());
    } else {
        println!(
            "{:<4} {:<16} {:<8} {:<9} DEPENDS_ON",
            "#", "UNIT", "KIND", "TIMEOUT"
        );
        for (i, unit) in graph.units().enumerate() {
            let deps: Vec<&str> = unit.depends_on.iter().map(UnitName::as_str).collect();
            println!(
                "{:<4} {:<16} {:<8} {:<9} {}",
                i + 1,
                unit.name.as_str(),
                format!("{:?}", unit.kind).to_lowercase(),
                format!("{:?}", unit.on_timeout).to_lowercase(),
                deps.join(", ")
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
