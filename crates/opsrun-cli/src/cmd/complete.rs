use crate::cmd::tick::print_dispatch;
use crate::context::{parse_at, Orchestrator};
use crate::output::print_json;
use anyhow::Context;
use opsrun_core::poller::CompletionPoller;
use std::path::Path;
use std::time::Duration;

pub fn run(
    config: &Path,
    budget_secs: Option<u64>,
    at: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let now = parse_at(at)?;
    let orch = Orchestrator::open(config)?;
    let budget = budget_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| orch.config.completion.budget());
    let report = CompletionPoller::new(&orch.ledger, &orch.registry, budget)
        .poll(now)
        .context("completion tick failed")?;
    let dispatched = orch.dispatch_ready(now)?;

    if json {
        return print_json(&serde_json::json!({
            "completion": report,
            "dispatch": dispatched,
        }));
    }
    println!(
        "Checked {}: {} completed, {} failed, {} timed out, {} still waiting",
        report.checked, report.completed, report.failed, report.timed_out, report.still_waiting
    );
    if report.deferred > 0 {
        println!("  deferred: {} (budget exhausted)", report.deferred);
    }
    if report.errors > 0 {
        eprintln!("[failed] {} instance(s) could not be checked", report.errors);
    }
    print_dispatch(&dispatched);
    println!(
        "Completion timer: {}",
        if report.timer_armed { "armed" } else { "disarmed" }
    );
    Ok(())
}
