use crate::context::Orchestrator;
use crate::output::{print_instances, print_json};
use anyhow::Context;
use opsrun_core::instance::InstanceStatus;
use std::path::Path;

pub fn list(config: &Path, status: Option<&str>, json: bool) -> anyhow::Result<()> {
    let status = status
        .map(|s| s.parse::<InstanceStatus>())
        .transpose()
        .context("invalid --status")?;
    let orch = Orchestrator::open(config)?;
    let instances = orch.ledger.list(status).context("failed to list instances")?;

    if json {
        return print_json(&instances);
    }
    print_instances(&instances);
    Ok(())
}

pub fn show(config: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let orch = Orchestrator::open(config)?;
    let instance = orch
        .ledger
        .get(id)
        .with_context(|| format!("failed to load instance '{id}'"))?;

    if json {
        return print_json(&instance);
    }
    print!("{}", serde_yaml::to_string(&instance)?);
    Ok(())
}
