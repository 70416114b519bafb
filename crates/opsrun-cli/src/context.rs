use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use opsrun_core::action::ActionRegistry;
use opsrun_core::config::OrchestratorConfig;
use opsrun_core::dispatch::{DispatchReport, Dispatcher};
use opsrun_core::ledger::ExecutionLedger;
use opsrun_core::scheduler::{Scheduler, StaticTargets};
use opsrun_core::task::TaskCatalog;
use std::path::Path;

/// Everything a command needs: the loaded config, the compiled task catalog
/// and an open ledger.
pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub registry: ActionRegistry,
    pub tasks: TaskCatalog,
    pub ledger: ExecutionLedger,
    targets: StaticTargets,
}

impl Orchestrator {
    pub fn open(config_path: &Path) -> Result<Self> {
        let config = OrchestratorConfig::load(config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?;
        let registry = ActionRegistry::builtin();
        let tasks = config
            .compile(&registry)
            .context("invalid task definitions")?;
        let ledger_path = config.resolve_ledger_path(config_path);
        let ledger = ExecutionLedger::open(&ledger_path, config.ledger.clone(), config.retry.clone())
            .with_context(|| format!("failed to open ledger {}", ledger_path.display()))?;
        let targets = config.targets();
        Ok(Orchestrator {
            config,
            registry,
            tasks,
            ledger,
            targets,
        })
    }

    pub fn scheduler(&self) -> Scheduler<'_> {
        Scheduler::new(
            &self.ledger,
            &self.tasks,
            &self.targets,
            self.config.task_list_tag.clone(),
        )
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.ledger, &self.registry, &self.tasks)
    }

    pub fn dispatch_ready(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        self.dispatcher()
            .run_ready(now)
            .context("failed to dispatch ready instances")
    }
}

/// `--at` / `--from` as a UTC instant, defaulting to now.
pub fn parse_at(at: Option<&str>) -> Result<DateTime<Utc>> {
    match at {
        Some(text) => Ok(DateTime::parse_from_rfc3339(text)
            .with_context(|| format!("'{text}' is not an RFC 3339 time"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_at_converts_offsets_to_utc() {
        let at = parse_at(Some("2024-05-01T04:00:00+02:00")).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap());
        assert!(parse_at(Some("yesterday")).is_err());
    }
}
