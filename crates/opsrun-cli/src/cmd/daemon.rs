use crate::context::Orchestrator;
use anyhow::Context;
use chrono::Utc;
use opsrun_core::poller::CompletionPoller;
use std::path::Path;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Host both timers until Ctrl-C. Ticks run on the blocking pool one at a
/// time; a tick that overruns its interval delays the next one.
///
/// Each tick reloads the config and opens the ledger for its own duration
/// only, so `opsrun event`, `fire` and friends can run between ticks.
pub fn run(config: &Path) -> anyhow::Result<()> {
    let (tick_every, complete_every, tasks) = {
        let orch = Orchestrator::open(config)?;
        (
            Duration::from_secs(orch.config.scheduler.tick_secs.max(1)),
            Duration::from_secs(orch.config.completion.interval_secs.max(1)),
            orch.tasks.len(),
        )
    };
    let config = config.to_path_buf();

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(async move {
        let mut schedule = tokio::time::interval(tick_every);
        schedule.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut completion = tokio::time::interval(complete_every);
        completion.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            tasks,
            tick_secs = tick_every.as_secs(),
            completion_secs = complete_every.as_secs(),
            "opsrun running, Ctrl-C to stop"
        );

        loop {
            tokio::select! {
                _ = schedule.tick() => {
                    let config = config.clone();
                    run_blocking(move || scheduling_tick(&Orchestrator::open(&config)?)).await;
                }
                _ = completion.tick() => {
                    let config = config.clone();
                    run_blocking(move || completion_tick(&Orchestrator::open(&config)?)).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                    break;
                }
            }
        }
        anyhow::Ok(())
    })
}

async fn run_blocking<F>(f: F)
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("{e:#}"),
        Err(e) => tracing::error!("tick panicked: {e}"),
    }
}

fn scheduling_tick(orch: &Orchestrator) -> anyhow::Result<()> {
    let now = Utc::now();
    let report = orch.scheduler().tick(now).context("scheduling tick failed")?;
    for (task, error) in &report.failures {
        tracing::warn!(task = %task, error = %error, "task not fired");
    }
    let dispatched = orch.dispatch_ready(now)?;
    tracing::info!(
        created = report.created.len(),
        dispatched = dispatched.dispatched.len(),
        queued = dispatched.queued,
        next = ?report.next_run.as_ref().map(|n| n.at),
        "tick"
    );
    Ok(())
}

/// The completion timer arms itself when an instance enters
/// WAIT_FOR_COMPLETION and disarms once nothing is left to probe.
fn completion_tick(orch: &Orchestrator) -> anyhow::Result<()> {
    if !orch.ledger.completion_timer_armed()? {
        tracing::debug!("completion timer disarmed, skipping");
        return Ok(());
    }
    let now = Utc::now();
    let report = CompletionPoller::new(&orch.ledger, &orch.registry, orch.config.completion.budget())
        .poll(now)
        .context("completion tick failed")?;
    let dispatched = orch.dispatch_ready(now)?;
    tracing::info!(
        checked = report.checked,
        completed = report.completed,
        timed_out = report.timed_out,
        promoted = report.promoted.len(),
        dispatched = dispatched.dispatched.len(),
        armed = report.timer_armed,
        "completion"
    );
    Ok(())
}
