//! `converge plan` - show the execution order without running anything

use anyhow::Result;
use colored::Colorize;
use declarative::{Phase, Resource, ResourceManager};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Context;
use crate::cli::PlanArgs;
use crate::ui;

#[derive(Debug, Serialize)]
struct PlanEntry {
    position: usize,
    uid: String,
    #[serde(rename = "type")]
    fqname: String,
    host: String,
    depends_on: Vec<String>,
    /// Action names keyed by phase, in run order
    actions: BTreeMap<String, Vec<String>>,
}

pub fn run(ctx: &Context, args: PlanArgs) -> Result<()> {
    let manager = super::load(ctx, &args.source)?;
    super::prepare(&manager)?;
    let plan = build(&manager)?;
    manager.close()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    if plan.is_empty() {
        ui::info("Nothing to converge");
        return Ok(());
    }

    ui::header("Execution plan");
    for entry in &plan {
        ui::step(
            entry.position,
            plan.len(),
            &format!("{} {}", entry.uid.bold(), format!("({})", entry.fqname).dimmed()),
        );
        if entry.host != declarative::DEFAULT_HOST || ctx.verbose > 0 {
            ui::kv("host", &entry.host);
        }
        if !entry.depends_on.is_empty() {
            ui::kv("after", &entry.depends_on.join(", "));
        }
        for (phase, actions) in &entry.actions {
            ui::kv(phase, &actions.join(", "));
        }
    }
    Ok(())
}

fn build(manager: &ResourceManager) -> Result<Vec<PlanEntry>> {
    manager
        .execution_order()?
        .iter()
        .enumerate()
        .map(|(i, resource)| entry(manager, i + 1, resource))
        .collect()
}

fn entry(manager: &ResourceManager, position: usize, resource: &Arc<Resource>) -> Result<PlanEntry> {
    let depends_on = resource
        .dependencies()
        .into_iter()
        .map(|handle| Ok(manager.get(handle)?.uid().to_string()))
        .collect::<Result<Vec<_>>>()?;

    let definition = resource.definition();
    let actions = Phase::ALL
        .iter()
        .filter_map(|&phase| {
            let names: Vec<String> = definition
                .actions_for(phase)
                .iter()
                .map(|action| action.name().to_string())
                .collect();
            (!names.is_empty()).then(|| (phase.to_string(), names))
        })
        .collect();

    Ok(PlanEntry {
        position,
        uid: resource.uid().to_string(),
        fqname: resource.fqname().to_string(),
        host: resource.host().to_string(),
        depends_on,
        actions,
    })
}
