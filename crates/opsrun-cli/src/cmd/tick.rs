use crate::context::{parse_at, Orchestrator};
use crate::output::{print_failures, print_instances, print_json, timestamp};
use anyhow::Context;
use opsrun_core::dispatch::DispatchReport;
use std::path::Path;

pub fn run(config: &Path, at: Option<&str>, json: bool) -> anyhow::Result<()> {
    let now = parse_at(at)?;
    let orch = Orchestrator::open(config)?;
    let report = orch.scheduler().tick(now).context("scheduling tick failed")?;
    let dispatched = orch.dispatch_ready(now)?;

    if json {
        return print_json(&serde_json::json!({
            "tick": report,
            "dispatch": dispatched,
        }));
    }

    if report.created.is_empty() {
        println!("No tasks due at {}.", timestamp(&now));
    } else {
        println!("Created {} instance(s):", report.created.len());
        print_instances(&report.created);
    }
    for task in &report.skipped {
        println!("  skipped: {task} (already ran this minute)");
    }
    print_failures(&report.failures);
    print_dispatch(&dispatched);
    match &report.next_run {
        Some(next) => println!("Next run: {} at {}", next.task, timestamp(&next.at)),
        None => println!("Next run: none within 24h"),
    }
    Ok(())
}

pub fn print_dispatch(report: &DispatchReport) {
    if !report.dispatched.is_empty() {
        println!("Dispatched {} instance(s):", report.dispatched.len());
        print_instances(&report.dispatched);
    }
    if report.queued > 0 {
        println!("  queued:  {} waiting for a free slot", report.queued);
    }
    print_failures(&report.failures);
}
