use crate::context::{parse_at, Orchestrator};
use crate::output::{print_instances, print_json};
use anyhow::Context;
use opsrun_core::gate::ConcurrencyGate;
use std::path::Path;

pub fn run(config: &Path, at: Option<&str>, json: bool) -> anyhow::Result<()> {
    let now = parse_at(at)?;
    let orch = Orchestrator::open(config)?;
    let outcome = ConcurrencyGate::new(&orch.ledger)
        .reconcile_all(now)
        .context("reconciliation failed")?;

    if json {
        return print_json(&outcome);
    }
    if outcome.is_empty() {
        println!("Every concurrency key is within its limit.");
        return Ok(());
    }
    if !outcome.promoted.is_empty() {
        println!("Promoted {} instance(s):", outcome.promoted.len());
        print_instances(&outcome.promoted);
    }
    if !outcome.demoted.is_empty() {
        println!("Requeued {} over-admitted instance(s):", outcome.demoted.len());
        print_instances(&outcome.demoted);
    }
    Ok(())
}
