//! Admission control per concurrency key.
//!
//! Admission is a count-then-write against the ledger with no lock, so two
//! workers can both take the last slot. [`ConcurrencyGate::reconcile`] is
//! the backstop: it puts the newest over-admitted instances that have not
//! run yet back to WAITING, and promotes the oldest WAITING ones when slots
//! are free.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::action::ActionArgs;
use crate::error::Result;
use crate::instance::{ExecutionInstance, InstanceStatus};
use crate::ledger::ExecutionLedger;
use crate::task::Task;

/// Instances moved by one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Reconciliation {
    pub promoted: Vec<ExecutionInstance>,
    pub demoted: Vec<ExecutionInstance>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.demoted.is_empty()
    }

    fn absorb(&mut self, other: Reconciliation) {
        self.promoted.extend(other.promoted);
        self.demoted.extend(other.demoted);
    }
}

pub struct ConcurrencyGate<'a> {
    ledger: &'a ExecutionLedger,
}

impl<'a> ConcurrencyGate<'a> {
    pub fn new(ledger: &'a ExecutionLedger) -> Self {
        ConcurrencyGate { ledger }
    }

    /// Resolve a PENDING instance into STARTED or WAITING.
    pub fn admit(
        &self,
        instance: &ExecutionInstance,
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<ExecutionInstance> {
        let limit = task.concurrency_limit();
        let args = ActionArgs::from_instance(
            instance,
            task.tag_filter().map(|f| f.as_str()),
            now,
        );
        let Some(key) = task.descriptor().concurrency_key(&args, limit) else {
            return self
                .ledger
                .set_status(&instance.id, InstanceStatus::Started, now);
        };

        let status = match limit {
            Some(limit) => {
                let active = self.ledger.active_count(&key)?;
                if active < limit as usize {
                    InstanceStatus::Started
                } else {
                    tracing::info!(task = task.name(), instance = %instance.id, %key, active, limit, "no free slot, queueing");
                    InstanceStatus::Waiting
                }
            }
            None => InstanceStatus::Started,
        };
        let mut fields = Map::new();
        fields.insert("concurrency_key".into(), Value::String(key.clone()));
        fields.insert("concurrency_id".into(), Value::String(key));
        fields.insert("concurrency_limit".into(), json!(limit));
        self.ledger.update(&instance.id, Some(status), &fields, now)
    }

    /// A slot under `key` was freed: promote waiting instances into it.
    pub fn release(&self, key: &str, now: DateTime<Utc>) -> Result<Vec<ExecutionInstance>> {
        Ok(self.reconcile(key, now)?.promoted)
    }

    /// Bring `key` back to at most its limit of active instances, then fill
    /// free slots from the waiting queue, earliest created first.
    pub fn reconcile(&self, key: &str, now: DateTime<Utc>) -> Result<Reconciliation> {
        let active = self.ledger.active_instances(key)?;
        let waiting = self.ledger.waiting_instances(key)?;
        let mut outcome = Reconciliation::default();

        let limit = active
            .iter()
            .chain(&waiting)
            .filter_map(|i| i.concurrency_limit)
            .min()
            .map(|l| l as usize);

        let Some(limit) = limit else {
            for instance in waiting {
                outcome
                    .promoted
                    .push(self.ledger.set_status(&instance.id, InstanceStatus::Started, now)?);
            }
            return Ok(outcome);
        };

        if active.len() > limit {
            let mut demotable: Vec<&ExecutionInstance> = active
                .iter()
                .filter(|i| i.status == InstanceStatus::Started && !i.is_dispatched())
                .collect();
            demotable.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
            for instance in demotable.into_iter().take(active.len() - limit) {
                tracing::warn!(instance = %instance.id, key, limit, "over-admitted, requeueing");
                outcome
                    .demoted
                    .push(self.ledger.set_status(&instance.id, InstanceStatus::Waiting, now)?);
            }
            return Ok(outcome);
        }

        for instance in waiting.into_iter().take(limit - active.len()) {
            tracing::info!(instance = %instance.id, key, "slot freed, starting");
            outcome
                .promoted
                .push(self.ledger.set_status(&instance.id, InstanceStatus::Started, now)?);
        }
        Ok(outcome)
    }

    /// Reconcile every key that currently holds a marker.
    pub fn reconcile_all(&self, now: DateTime<Utc>) -> Result<Reconciliation> {
        let mut outcome = Reconciliation::default();
        for key in self.ledger.concurrency_keys()? {
            outcome.absorb(self.reconcile(&key, now)?);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::instance::TriggerSource;
    use crate::ledger::{LedgerSettings, RedbStore};
    use crate::retry::RetryPolicy;
    use crate::task::{Target, TaskDefinition};
    use chrono::{Duration, TimeZone};
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap() + Duration::seconds(secs)
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

    fn limited(limit: u32) -> Task {
        let def = TaskDefinition {
            max_concurrency: Some(limit),
            ..TaskDefinition::new("limited", "noop")
        };
        Task::compile(def, &ActionRegistry::builtin()).unwrap()
    }

    fn create(ledger: &ExecutionLedger, task: &Task, now: DateTime<Utc>) -> ExecutionInstance {
        let pending = ledger
            .add(task, &Target::new("1", "r"), Value::Null, TriggerSource::Schedule, now, now)
            .unwrap();
        ConcurrencyGate::new(ledger).admit(&pending, task, now).unwrap()
    }

    #[test]
    fn unkeyed_actions_always_start() {
        let (_dir, ledger) = open_tmp();
        let task = Task::compile(TaskDefinition::new("free", "noop"), &ActionRegistry::builtin()).unwrap();
        for i in 0..5 {
            let inst = create(&ledger, &task, at(i));
            assert_eq!(inst.status, InstanceStatus::Started);
            assert!(inst.concurrency_id.is_none());
        }
    }

    #[test]
    fn limit_n_admits_n_and_queues_the_rest() {
        let (_dir, ledger) = open_tmp();
        let task = limited(2);
        let statuses: Vec<_> = (0..5).map(|i| create(&ledger, &task, at(i)).status).collect();
        assert_eq!(
            statuses,
            vec![
                InstanceStatus::Started,
                InstanceStatus::Started,
                InstanceStatus::Waiting,
                InstanceStatus::Waiting,
                InstanceStatus::Waiting,
            ]
        );
        assert_eq!(ledger.active_count("noop").unwrap(), 2);
        assert_eq!(ledger.waiting_instances("noop").unwrap().len(), 3);
    }

    #[test]
    fn completing_one_promotes_exactly_the_earliest_waiting() {
        let (_dir, ledger) = open_tmp();
        let task = limited(1);
        let gate = ConcurrencyGate::new(&ledger);
        let first = create(&ledger, &task, at(0));
        let second = create(&ledger, &task, at(1));
        let third = create(&ledger, &task, at(2));
        ledger.flush().unwrap();

        ledger.set_status(&first.id, InstanceStatus::Completed, at(10)).unwrap();
        let promoted = gate.release("noop", at(10)).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, second.id);
        assert_eq!(ledger.get(&third.id).unwrap().status, InstanceStatus::Waiting);

        // Nothing freed, nothing moves.
        assert!(gate.reconcile("noop", at(11)).unwrap().is_empty());
    }

    #[test]
    fn reconcile_demotes_newest_undispatched() {
        let (_dir, ledger) = open_tmp();
        let task = limited(1);
        let gate = ConcurrencyGate::new(&ledger);
        let first = create(&ledger, &task, at(0));
        let second = create(&ledger, &task, at(1));
        // Simulate a racing worker that also took the slot.
        let fields = json!({"concurrency_id": "noop", "concurrency_key": "noop"});
        ledger
            .update(&second.id, Some(InstanceStatus::Started), fields.as_object().unwrap(), at(1))
            .unwrap();
        let extra = create(&ledger, &task, at(2));
        assert_eq!(extra.status, InstanceStatus::Waiting);
        assert_eq!(ledger.active_count("noop").unwrap(), 2);

        let outcome = gate.reconcile_all(at(5)).unwrap();
        assert_eq!(outcome.demoted.len(), 1);
        assert_eq!(outcome.demoted[0].id, second.id);
        assert!(outcome.promoted.is_empty());
        assert_eq!(ledger.get(&first.id).unwrap().status, InstanceStatus::Started);
    }

    #[test]
    fn dispatched_instances_are_never_demoted() {
        let (_dir, ledger) = open_tmp();
        let task = limited(1);
        let first = create(&ledger, &task, at(0));
        let second = create(&ledger, &task, at(1));
        let fields = json!({"concurrency_id": "noop", "started_at": at(1)});
        ledger
            .update(&second.id, Some(InstanceStatus::Started), fields.as_object().unwrap(), at(1))
            .unwrap();
        let fields = json!({"started_at": at(0)});
        ledger
            .update(&first.id, None, fields.as_object().unwrap(), at(1))
            .unwrap();

        let outcome = ConcurrencyGate::new(&ledger).reconcile("noop", at(2)).unwrap();
        assert!(outcome.is_empty());
    }

    #[test]
    fn racing_workers_are_healed_by_reconciliation() {
        const LIMIT: u32 = 2;
        const WORKERS: usize = 6;
        let dir = TempDir::new().unwrap();
        let store: Arc<RedbStore> = Arc::new(RedbStore::open(&dir.path().join("shared.redb")).unwrap());
        let task = Arc::new(limited(LIMIT));
        let barrier = Arc::new(Barrier::new(WORKERS));

        let handles: Vec<_> = (0..WORKERS)
            .map(|i| {
                let store = store.clone();
                let task = task.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let ledger = ExecutionLedger::new(store, LedgerSettings::default(), RetryPolicy::immediate(3));
                    let pending = ledger
                        .add(&task, &Target::new("1", "r"), Value::Null, TriggerSource::Event, at(0), at(i as i64))
                        .unwrap();
                    ledger.flush().unwrap();
                    barrier.wait();
                    ConcurrencyGate::new(&ledger).admit(&pending, &task, at(i as i64)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let ledger = ExecutionLedger::new(store, LedgerSettings::default(), RetryPolicy::immediate(3));
        ConcurrencyGate::new(&ledger).reconcile_all(at(60)).unwrap();
        assert_eq!(ledger.active_count("noop").unwrap(), LIMIT as usize);
        assert_eq!(
            ledger.waiting_instances("noop").unwrap().len(),
            WORKERS - LIMIT as usize
        );
    }
}
