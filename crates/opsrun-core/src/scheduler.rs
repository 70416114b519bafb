//! Decides which tasks fire, on a timer tick or an inbound resource event,
//! and creates their execution instances.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{OpsError, Result};
use crate::gate::ConcurrencyGate;
use crate::instance::{ExecutionInstance, TriggerSource};
use crate::ledger::ExecutionLedger;
use crate::tagging::Tags;
use crate::task::{Target, Task, TaskCatalog};

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Resolves the (account, region) pairs a scheduled task runs against.
pub trait TargetResolver {
    fn resolve(&self, task: &Task) -> Vec<Target>;
}

/// Uses the task's own accounts and regions, falling back to this account
/// and the default region.
#[derive(Debug, Clone)]
pub struct StaticTargets {
    pub account: String,
    pub default_region: String,
}

impl StaticTargets {
    pub fn new(account: impl Into<String>, default_region: impl Into<String>) -> Self {
        StaticTargets {
            account: account.into(),
            default_region: default_region.into(),
        }
    }
}

impl TargetResolver for StaticTargets {
    fn resolve(&self, task: &Task) -> Vec<Target> {
        let definition = task.definition();
        let accounts = if definition.accounts.is_empty() {
            vec![self.account.clone()]
        } else {
            definition.accounts.clone()
        };
        let regions = if definition.regions.is_empty() {
            vec![self.default_region.clone()]
        } else {
            definition.regions.clone()
        };
        accounts
            .iter()
            .flat_map(|account| regions.iter().map(move |region| Target::new(account, region)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An inbound resource-change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub source: String,
    pub detail_type: String,
    /// Event name within the detail type, e.g. `CreateTags`.
    pub name: String,
    pub account: String,
    pub region: String,
    #[serde(default)]
    pub resources: Vec<String>,
    /// Resource tags after the change, for tag-change events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_tag_keys: Vec<String>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NextRun {
    pub task: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub created: Vec<ExecutionInstance>,
    /// Tasks already handled for this minute.
    pub skipped: Vec<String>,
    /// (task, error) for tasks whose firing was aborted.
    pub failures: Vec<(String, String)>,
    /// Earliest scheduled firing within the next 24 hours.
    pub next_run: Option<NextRun>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventReport {
    pub triggered: Vec<ExecutionInstance>,
    pub failures: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler<'a> {
    ledger: &'a ExecutionLedger,
    tasks: &'a TaskCatalog,
    targets: &'a dyn TargetResolver,
    task_list_tag: String,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        ledger: &'a ExecutionLedger,
        tasks: &'a TaskCatalog,
        targets: &'a dyn TargetResolver,
        task_list_tag: impl Into<String>,
    ) -> Self {
        Scheduler {
            ledger,
            tasks,
            targets,
            task_list_tag: task_list_tag.into(),
        }
    }

    /// One scheduling tick. Each enabled task with an interval fires at most
    /// once per tick when a cron match lies in `(last run, now]`; a task that
    /// fails is reported and the rest of the tick carries on.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let minute = truncate_minute(now);
        let mut report = TickReport::default();

        for task in self.tasks.enabled() {
            let Some(schedule) = task.schedule() else {
                continue;
            };
            let last = match self.ledger.last_run(task.name()) {
                Ok(last) => last.unwrap_or(minute - Duration::minutes(1)),
                Err(e) => {
                    tracing::warn!(task = task.name(), error = %e, "cannot read last run");
                    report.failures.push((task.name().to_string(), e.to_string()));
                    continue;
                }
            };
            if last >= minute {
                report.skipped.push(task.name().to_string());
                continue;
            }

            let tz = task.timezone();
            let due = schedule.last_since(last.with_timezone(&tz), minute.with_timezone(&tz));
            let fired = match due {
                Some(fired_at) => {
                    tracing::info!(task = task.name(), fired_at = %fired_at, "task due");
                    self.create_for_targets(task, TriggerSource::Schedule, fired_at.with_timezone(&Utc), now)
                }
                None => Ok(Vec::new()),
            };
            match fired.and_then(|created| {
                self.ledger.set_last_run(task.name(), minute)?;
                Ok(created)
            }) {
                Ok(created) => report.created.extend(created),
                Err(e) => {
                    tracing::warn!(task = task.name(), error = %e, "task firing aborted");
                    report.failures.push((task.name().to_string(), e.to_string()));
                }
            }
        }

        report.next_run = self.next_run(minute);
        self.ledger.log_retry_stats();
        Ok(report)
    }

    /// Earliest cron match among enabled tasks within 24 hours of `after`.
    pub fn next_run(&self, after: DateTime<Utc>) -> Option<NextRun> {
        self.tasks
            .enabled()
            .filter_map(|task| {
                let tz = task.timezone();
                task.schedule()?
                    .first_within_next(Duration::hours(24), after.with_timezone(&tz))
                    .map(|at| NextRun {
                        task: task.name().to_string(),
                        at: at.with_timezone(&Utc),
                    })
            })
            .min_by_key(|next| next.at)
    }

    /// Create one instance per task that subscribes to `event` and whose
    /// scope and tag filter accept it.
    pub fn handle_event(&self, event: &ResourceEvent, now: DateTime<Utc>) -> Result<EventReport> {
        let mut report = EventReport::default();
        let target = Target::new(&event.account, &event.region);
        for task in self.tasks.enabled() {
            if !self.event_matches(task, event) {
                continue;
            }
            tracing::info!(task = task.name(), event = %event.name, account = %event.account, region = %event.region, "event matched");
            let created = self
                .create(task, &target, json!(event.resources), TriggerSource::Event, now, now)
                .and_then(|instance| {
                    self.ledger.flush()?;
                    Ok(instance)
                });
            match created {
                Ok(instance) => report.triggered.push(instance),
                Err(e) => {
                    tracing::warn!(task = task.name(), error = %e, "event trigger aborted");
                    report.failures.push((task.name().to_string(), e.to_string()));
                }
            }
        }
        self.ledger.log_retry_stats();
        Ok(report)
    }

    /// Fire `name` now regardless of its schedule.
    pub fn fire_task(&self, name: &str, now: DateTime<Utc>) -> Result<Vec<ExecutionInstance>> {
        let task = self.tasks.require(name)?;
        if !task.is_enabled() {
            tracing::info!(task = name, "firing a disabled task on request");
        }
        self.create_for_targets(task, TriggerSource::Manual, now, now)
    }

    fn event_matches(&self, task: &Task, event: &ResourceEvent) -> bool {
        if !task.listens_for(&event.source, &event.detail_type, &event.name) {
            return false;
        }
        let definition = task.definition();
        if !definition.accounts.is_empty() && !definition.accounts.contains(&event.account) {
            return false;
        }
        if !definition.regions.is_empty() && !definition.regions.contains(&event.region) {
            return false;
        }
        match (task.tag_filter(), &event.tags) {
            (Some(filter), Some(tags)) => {
                let relevant = event.changed_tag_keys.is_empty()
                    || event.changed_tag_keys.iter().any(|k| filter.references(k));
                relevant && filter.is_match(tags)
            }
            (Some(_), None) => false,
            (None, Some(tags)) => tags.get(&self.task_list_tag).is_some_and(|list| {
                list.split(|c: char| c == ',' || c.is_whitespace())
                    .any(|name| name == task.name())
            }),
            (None, None) => true,
        }
    }

    fn create_for_targets(
        &self,
        task: &Task,
        source: TriggerSource,
        fired_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionInstance>> {
        let targets = self.targets.resolve(task);
        if targets.is_empty() {
            return Err(OpsError::Configuration(format!(
                "task '{}' resolves to no targets",
                task.name()
            )));
        }
        let mut created: Vec<ExecutionInstance> = Vec::with_capacity(targets.len());
        for target in &targets {
            match self.create(task, target, Value::Null, source, fired_at, now) {
                Ok(instance) => created.push(instance),
                Err(e) => {
                    // The firing is retried whole, so nothing of it may be written.
                    let ids: Vec<&str> = created.iter().map(|i| i.id.as_str()).collect();
                    self.ledger.discard(&ids)?;
                    return Err(e);
                }
            }
        }
        self.ledger.flush()?;
        Ok(created)
    }

    fn create(
        &self,
        task: &Task,
        target: &Target,
        resources: Value,
        source: TriggerSource,
        fired_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionInstance> {
        let pending = self.ledger.add(task, target, resources, source, fired_at, now)?;
        match ConcurrencyGate::new(self.ledger).admit(&pending, task, now) {
            Ok(admitted) => Ok(admitted),
            Err(e) => {
                self.ledger.discard(&[pending.id.as_str()])?;
                Err(e)
            }
        }
    }

}

fn truncate_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::minutes(1)).unwrap_or(t)
}
