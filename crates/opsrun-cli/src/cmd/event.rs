use crate::cmd::tick::print_dispatch;
use crate::context::{parse_at, Orchestrator};
use crate::output::{print_failures, print_instances, print_json};
use anyhow::Context;
use opsrun_core::scheduler::ResourceEvent;
use std::io::Read;
use std::path::Path;

pub fn run(config: &Path, file: &Path, at: Option<&str>, json: bool) -> anyhow::Result<()> {
    let now = parse_at(at)?;
    let event = read_event(file)?;
    let orch = Orchestrator::open(config)?;
    let report = orch
        .scheduler()
        .handle_event(&event, now)
        .context("failed to handle event")?;
    let dispatched = orch.dispatch_ready(now)?;

    if json {
        return print_json(&serde_json::json!({
            "event": report,
            "dispatch": dispatched,
        }));
    }
    if report.triggered.is_empty() {
        println!(
            "No task listens for {} / {} / {}.",
            event.source, event.detail_type, event.name
        );
    } else {
        println!("Triggered {} instance(s):", report.triggered.len());
        print_instances(&report.triggered);
    }
    print_failures(&report.failures);
    print_dispatch(&dispatched);
    Ok(())
}

fn read_event(file: &Path) -> anyhow::Result<ResourceEvent> {
    let data = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read event from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?
    };
    serde_json::from_str(&data).context("malformed event")
}
