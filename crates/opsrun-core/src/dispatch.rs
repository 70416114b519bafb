//! Runs admitted instances through their action's `execute()`.

use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::action::{ActionArgs, ActionRegistry};
use crate::error::Result;
use crate::gate::ConcurrencyGate;
use crate::instance::{ExecutionInstance, InstanceStatus};
use crate::ledger::ExecutionLedger;
use crate::task::TaskCatalog;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    /// Instances whose action ran, in their post-execute state.
    pub dispatched: Vec<ExecutionInstance>,
    /// PENDING instances resolved to WAITING instead of running.
    pub queued: usize,
    /// (instance id, error) for instances that could not be dispatched.
    pub failures: Vec<(String, String)>,
}

pub struct Dispatcher<'a> {
    ledger: &'a ExecutionLedger,
    registry: &'a ActionRegistry,
    tasks: &'a TaskCatalog,
}

impl<'a> Dispatcher<'a> {
    pub fn new(ledger: &'a ExecutionLedger, registry: &'a ActionRegistry, tasks: &'a TaskCatalog) -> Self {
        Dispatcher {
            ledger,
            registry,
            tasks,
        }
    }

    /// Admit anything still PENDING, then execute every STARTED instance
    /// that has not run yet. Keys are reconciled first so an over-admitted
    /// instance is requeued instead of executed. Slots freed by synchronous
    /// actions are refilled within the same pass. A ledger error on one
    /// instance is reported and the pass moves on to the next.
    pub fn run_ready(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let gate = ConcurrencyGate::new(self.ledger);
        let mut report = DispatchReport::default();

        let keys: BTreeSet<String> = self
            .ledger
            .ready_instances()?
            .into_iter()
            .filter_map(|i| i.concurrency_id)
            .collect();
        for key in keys {
            if let Err(e) = gate.reconcile(&key, now) {
                tracing::warn!(key = %key, error = %e, "reconciliation failed");
            }
        }

        let mut queue: VecDeque<ExecutionInstance> = self.ledger.ready_instances()?.into();
        while let Some(instance) = queue.pop_front() {
            let instance = if instance.status == InstanceStatus::Pending {
                match self.tasks.get(&instance.task) {
                    Some(task) => match gate.admit(&instance, task, now) {
                        Ok(admitted) => admitted,
                        Err(e) => {
                            tracing::warn!(instance = %instance.id, task = %instance.task, error = %e, "admission failed");
                            report.failures.push((instance.id, e.to_string()));
                            continue;
                        }
                    },
                    None => {
                        let error = format!("task '{}' is no longer defined", instance.task);
                        if let Err(e) = self.fail(&instance, &error, now) {
                            tracing::warn!(instance = %instance.id, error = %e, "cannot fail orphaned instance");
                        }
                        report.failures.push((instance.id, error));
                        continue;
                    }
                }
            } else {
                instance
            };
            if instance.status != InstanceStatus::Started {
                report.queued += 1;
                continue;
            }

            match self.dispatch(&instance, now) {
                Ok(done) => {
                    if done.status.is_terminal() {
                        if let Some(key) = &done.concurrency_key {
                            match gate.release(key, now) {
                                Ok(promoted) => queue.extend(promoted),
                                Err(e) => {
                                    tracing::warn!(instance = %done.id, key = %key, error = %e, "slot release failed");
                                    report.failures.push((done.id.clone(), e.to_string()));
                                }
                            }
                        }
                    }
                    report.dispatched.push(done);
                }
                Err(e) => {
                    tracing::warn!(instance = %instance.id, task = %instance.task, error = %e, "dispatch failed");
                    report.failures.push((instance.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Execute one STARTED instance and record the outcome: COMPLETED for a
    /// synchronous action, WAIT_FOR_COMPLETION (arming the completion timer)
    /// for one with a probe, FAILED when the action raises.
    pub fn dispatch(&self, instance: &ExecutionInstance, now: DateTime<Utc>) -> Result<ExecutionInstance> {
        let descriptor = match self.registry.get(&instance.action) {
            Some(d) => d,
            None => {
                let error = format!("unknown action '{}'", instance.action);
                return self.fail(instance, &error, now);
            }
        };
        let tag_filter = self
            .tasks
            .get(&instance.task)
            .and_then(|t| t.tag_filter())
            .map(|f| f.as_str().to_string());

        let mut marker = Map::new();
        marker.insert("started_at".into(), json!(now));
        let instance = self.ledger.update(&instance.id, None, &marker, now)?;

        let args = ActionArgs::from_instance(&instance, tag_filter.as_deref(), now);
        let clock = Instant::now();
        let outcome = descriptor.build(args).and_then(|mut action| action.execute());

        let mut fields = Map::new();
        fields.insert(
            "execution_time_secs".into(),
            json!(clock.elapsed().as_secs_f64()),
        );
        let updated = match outcome {
            Ok(start_result) if instance.has_completion && !instance.dry_run => {
                fields.insert("start_result".into(), start_result);
                fields.insert("last_completion_check".into(), json!(now));
                let updated = self.ledger.update(
                    &instance.id,
                    Some(InstanceStatus::WaitForCompletion),
                    &fields,
                    now,
                )?;
                self.ledger.set_completion_timer(true)?;
                updated
            }
            Ok(result) => {
                fields.insert("result".into(), result);
                self.ledger
                    .update(&instance.id, Some(InstanceStatus::Completed), &fields, now)?
            }
            Err(e) => {
                tracing::warn!(instance = %instance.id, task = %instance.task, error = %e, "action failed");
                fields.insert("error".into(), Value::String(e.to_string()));
                self.ledger
                    .update(&instance.id, Some(InstanceStatus::Failed), &fields, now)?
            }
        };
        tracing::info!(instance = %updated.id, task = %updated.task, status = %updated.status, "dispatched");
        Ok(updated)
    }

    fn fail(&self, instance: &ExecutionInstance, error: &str, now: DateTime<Utc>) -> Result<ExecutionInstance> {
        let mut fields = Map::new();
        fields.insert("error".into(), Value::String(error.to_string()));
        self.ledger
            .update(&instance.id, Some(InstanceStatus::Failed), &fields, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionDescriptor, ActionError, ActionKind, ActionProperties, ActionResult};
    use crate::instance::TriggerSource;
    use crate::ledger::testing::KeyFaultStore;
    use crate::ledger::LedgerSettings;
    use crate::retry::RetryPolicy;
    use crate::task::{Target, TaskDefinition};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap()
    }

    fn open_tmp() -> (TempDir, ExecutionLedger) {
        let dir = TempDir::new().unwrap();
        let ledger = ExecutionLedger::open(
            &dir.path().join("ledger.redb"),
            LedgerSettings::default(),
            RetryPolicy::immediate(3),
        )
        .unwrap();
        (dir, ledger)
    }

    struct Broken;

    impl Action for Broken {
        fn execute(&mut self) -> ActionResult<Value> {
            Err(ActionError::Failed("volume is in use".into()))
        }
    }

    fn broken(_: ActionArgs) -> ActionResult<Box<dyn Action>> {
        Ok(Box::new(Broken))
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::builtin();
        registry
            .register(ActionDescriptor {
                id: "broken",
                description: "always fails",
                kind: ActionKind::Simple,
                properties: ActionProperties::default(),
                factory: broken,
                validate: None,
            })
            .unwrap();
        registry
    }

    fn catalog(registry: &ActionRegistry, defs: Vec<TaskDefinition>) -> TaskCatalog {
        TaskCatalog::compile(&defs, registry).unwrap()
    }

    fn enqueue(ledger: &ExecutionLedger, tasks: &TaskCatalog, name: &str) -> ExecutionInstance {
        let task = tasks.get(name).unwrap();
        ledger
            .add(task, &Target::new("1", "r"), Value::Null, TriggerSource::Manual, now(), now())
            .unwrap()
    }

    #[test]
    fn outcomes_by_action_kind() {
        let (_dir, ledger) = open_tmp();
        let registry = registry();
        let tasks = catalog(
            &registry,
            vec![
                TaskDefinition::new("sync", "noop"),
                TaskDefinition::new("long", "delay"),
                TaskDefinition::new("bad", "broken"),
            ],
        );
        let sync = enqueue(&ledger, &tasks, "sync");
        let long = enqueue(&ledger, &tasks, "long");
        let bad = enqueue(&ledger, &tasks, "bad");

        let report = Dispatcher::new(&ledger, &registry, &tasks).run_ready(now()).unwrap();
        assert_eq!(report.dispatched.len(), 3);
        assert!(report.failures.is_empty());

        let sync = ledger.get(&sync.id).unwrap();
        assert_eq!(sync.status, InstanceStatus::Completed);
        assert!(sync.result.is_some());
        assert!(sync.execution_time_secs.is_some());

        let long = ledger.get(&long.id).unwrap();
        assert_eq!(long.status, InstanceStatus::WaitForCompletion);
        assert!(long.start_result.is_some());
        assert_eq!(long.last_completion_check, Some(now()));
        assert!(ledger.completion_timer_armed().unwrap());

        let bad = ledger.get(&bad.id).unwrap();
        assert_eq!(bad.status, InstanceStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("volume is in use"));

        assert!(ledger.ready_instances().unwrap().is_empty());
    }

    #[test]
    fn dry_run_skips_completion_tracking() {
        let (_dir, ledger) = open_tmp();
        let registry = registry();
        let tasks = catalog(
            &registry,
            vec![TaskDefinition {
                dry_run: true,
                ..TaskDefinition::new("long", "delay")
            }],
        );
        let inst = enqueue(&ledger, &tasks, "long");
        Dispatcher::new(&ledger, &registry, &tasks).run_ready(now()).unwrap();
        assert_eq!(ledger.get(&inst.id).unwrap().status, InstanceStatus::Completed);
        assert!(!ledger.completion_timer_armed().unwrap());
    }

    #[test]
    fn synchronous_completions_refill_slots_in_the_same_pass() {
        let (_dir, ledger) = open_tmp();
        let registry = registry();
        let tasks = catalog(
            &registry,
            vec![TaskDefinition {
                max_concurrency: Some(1),
                ..TaskDefinition::new("one-at-a-time", "noop")
            }],
        );
        let gate = ConcurrencyGate::new(&ledger);
        let task = tasks.get("one-at-a-time").unwrap();
        for _ in 0..3 {
            let pending = enqueue(&ledger, &tasks, "one-at-a-time");
            gate.admit(&pending, task, now()).unwrap();
        }
        assert_eq!(ledger.waiting_instances("noop").unwrap().len(), 2);

        let report = Dispatcher::new(&ledger, &registry, &tasks).run_ready(now()).unwrap();
        assert_eq!(report.dispatched.len(), 3);
        assert_eq!(report.queued, 0);
        assert_eq!(ledger.list(Some(InstanceStatus::Completed)).unwrap().len(), 3);
    }

    #[test]
    fn long_running_actions_hold_their_slot() {
        let (_dir, ledger) = open_tmp();
        let registry = registry();
        let tasks = catalog(
            &registry,
            vec![TaskDefinition {
                max_concurrency: Some(1),
                ..TaskDefinition::new("serial", "delay")
            }],
        );
        for _ in 0..3 {
            enqueue(&ledger, &tasks, "serial");
        }
        let report = Dispatcher::new(&ledger, &registry, &tasks).run_ready(now()).unwrap();
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.queued, 2);
        assert_eq!(ledger.waiting_instances("delay").unwrap().len(), 2);
    }

    #[test]
    fn orphaned_pending_instances_fail() {
        let (_dir, ledger) = open_tmp();
        let registry = registry();
        let old = catalog(&registry, vec![TaskDefinition::new("retired", "noop")]);
        let inst = enqueue(&ledger, &old, "retired");

        let current = catalog(&registry, vec![]);
        let report = Dispatcher::new(&ledger, &registry, &current).run_ready(now()).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(ledger.get(&inst.id).unwrap().status, InstanceStatus::Failed);
    }

    #[test]
    fn an_unreadable_key_does_not_stall_other_instances() {
        let dir = TempDir::new().unwrap();
        let store = KeyFaultStore::open(&dir.path().join("ledger.redb"));
        let ledger = store.ledger();
        let registry = registry();
        let tasks = catalog(
            &registry,
            vec![
                TaskDefinition {
                    max_concurrency: Some(1),
                    ..TaskDefinition::new("keyed", "noop")
                },
                TaskDefinition {
                    max_concurrency: Some(1),
                    ..TaskDefinition::new("other", "delay")
                },
            ],
        );
        let keyed = enqueue(&ledger, &tasks, "keyed");
        let other = enqueue(&ledger, &tasks, "other");

        store.break_key("noop");
        let report = Dispatcher::new(&ledger, &registry, &tasks).run_ready(now()).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, keyed.id);
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(ledger.get(&other.id).unwrap().status, InstanceStatus::WaitForCompletion);
        assert_eq!(ledger.get(&keyed.id).unwrap().status, InstanceStatus::Pending);

        store.mend();
        let report = Dispatcher::new(&ledger, &registry, &tasks).run_ready(now()).unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(ledger.get(&keyed.id).unwrap().status, InstanceStatus::Completed);
    }
}
