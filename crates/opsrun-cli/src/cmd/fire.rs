use crate::cmd::tick::print_dispatch;
use crate::context::{parse_at, Orchestrator};
use crate::output::{print_instances, print_json};
use anyhow::Context;
use std::path::Path;

pub fn run(config: &Path, task: &str, at: Option<&str>, json: bool) -> anyhow::Result<()> {
    let now = parse_at(at)?;
    let orch = Orchestrator::open(config)?;
    let created = orch
        .scheduler()
        .fire_task(task, now)
        .with_context(|| format!("failed to fire '{task}'"))?;
    let dispatched = orch.dispatch_ready(now)?;

    if json {
        return print_json(&serde_json::json!({
            "created": created,
            "dispatch": dispatched,
        }));
    }
    println!("Fired '{task}': {} instance(s)", created.len());
    print_instances(&created);
    print_dispatch(&dispatched);
    Ok(())
}
