//! Advances WAIT_FOR_COMPLETION instances by calling their completion probe.
//!
//! One [`CompletionPoller::poll`] call is one completion tick: it works
//! through the awaiting instances until its wall-clock budget runs out,
//! reconciles every concurrency key, and re-arms or disarms the completion
//! timer depending on whether anything is left to check. Ledger errors on
//! single instances or keys are counted in [`PollReport::errors`] and keep
//! the timer armed so the next tick picks them up.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::action::{ActionArgs, ActionRegistry};
use crate::error::{OpsError, Result};
use crate::gate::ConcurrencyGate;
use crate::instance::{ExecutionInstance, InstanceStatus};
use crate::ledger::ExecutionLedger;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub still_waiting: usize,
    /// Left for the next tick because the budget ran out.
    pub deferred: usize,
    pub errors: usize,
    pub promoted: Vec<String>,
    pub demoted: Vec<String>,
    /// Whether the completion timer stays armed after this tick.
    pub timer_armed: bool,
}

pub struct CompletionPoller<'a> {
    ledger: &'a ExecutionLedger,
    registry: &'a ActionRegistry,
    budget: Duration,
}

impl<'a> CompletionPoller<'a> {
    pub fn new(ledger: &'a ExecutionLedger, registry: &'a ActionRegistry, budget: Duration) -> Self {
        CompletionPoller {
            ledger,
            registry,
            budget,
        }
    }

    pub fn poll(&self, now: DateTime<Utc>) -> Result<PollReport> {
        let clock = Instant::now();
        let deadline = clock + self.budget;
        let gate = ConcurrencyGate::new(self.ledger);
        let mut report = PollReport::default();

        let awaiting = self.ledger.instances_awaiting_completion()?;
        for (index, instance) in awaiting.iter().enumerate() {
            if Instant::now() >= deadline {
                report.deferred = awaiting.len() - index;
                tracing::info!(deferred = report.deferred, "completion budget used up");
                break;
            }
            if instance.status != InstanceStatus::WaitForCompletion {
                continue;
            }
            report.checked += 1;
            let updated = match self.check(instance, now) {
                Ok(updated) => updated,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(instance = %instance.id, task = %instance.task, error = %e, "completion check failed");
                    continue;
                }
            };
            match updated.status {
                InstanceStatus::Completed => report.completed += 1,
                InstanceStatus::Failed => report.failed += 1,
                InstanceStatus::TimedOut => report.timed_out += 1,
                _ => report.still_waiting += 1,
            }
            if updated.status.is_terminal() {
                if let Some(key) = &updated.concurrency_key {
                    match gate.release(key, now) {
                        Ok(promoted) => report.promoted.extend(promoted.into_iter().map(|i| i.id)),
                        Err(e) => {
                            report.errors += 1;
                            tracing::warn!(instance = %updated.id, key = %key, error = %e, "slot release failed");
                        }
                    }
                }
            }
        }

        match self.ledger.concurrency_keys() {
            Ok(keys) => {
                for key in keys {
                    match gate.reconcile(&key, now) {
                        Ok(reconciled) => {
                            report
                                .promoted
                                .extend(reconciled.promoted.into_iter().map(|i| i.id));
                            report
                                .demoted
                                .extend(reconciled.demoted.into_iter().map(|i| i.id));
                        }
                        Err(e) => {
                            report.errors += 1;
                            tracing::warn!(key = %key, error = %e, "reconciliation failed");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                tracing::warn!(error = %e, "cannot list concurrency keys");
            }
        }

        report.timer_armed = report.deferred > 0
            || report.errors > 0
            || !self.ledger.instances_awaiting_completion()?.is_empty();
        self.ledger.set_completion_timer(report.timer_armed)?;
        if !report.timer_armed {
            tracing::info!("nothing awaiting completion, timer disarmed");
        }
        self.ledger.log_retry_stats();
        Ok(report)
    }

    /// Check one instance. The deadline overrides the probe: a late instance
    /// is timed out without calling any action code.
    pub fn check(&self, instance: &ExecutionInstance, now: DateTime<Utc>) -> Result<ExecutionInstance> {
        if instance.is_past_deadline(now) {
            let timeout = OpsError::CompletionTimeout {
                instance: instance.id.clone(),
                timeout_minutes: instance.timeout_minutes.unwrap_or_default(),
            };
            tracing::warn!(instance = %instance.id, task = %instance.task, "{timeout}");
            return self.finish(instance, InstanceStatus::TimedOut, "error", Value::String(timeout.to_string()), now);
        }

        let Some(descriptor) = self.registry.get(&instance.action) else {
            let error = format!("unknown action '{}'", instance.action);
            return self.finish(instance, InstanceStatus::Failed, "error", Value::String(error), now);
        };

        let args = ActionArgs::from_instance(instance, None, now);
        let start_result = instance.start_result.clone().unwrap_or(Value::Null);
        let probe = descriptor
            .build(args)
            .and_then(|mut action| action.is_completed(&start_result));

        match probe {
            Ok(Some(result)) if !is_empty(&result) => {
                tracing::info!(instance = %instance.id, task = %instance.task, "completed");
                self.finish(instance, InstanceStatus::Completed, "result", result, now)
            }
            Ok(_) => {
                let mut fields = Map::new();
                fields.insert("last_completion_check".into(), json!(now));
                self.ledger.update(&instance.id, None, &fields, now)
            }
            Err(e) => {
                tracing::warn!(instance = %instance.id, task = %instance.task, error = %e, "completion probe raised");
                self.finish(instance, InstanceStatus::Failed, "error", Value::String(e.to_string()), now)
            }
        }
    }

    fn finish(
        &self,
        instance: &ExecutionInstance,
        status: InstanceStatus,
        field: &str,
        value: Value,
        now: DateTime<Utc>,
    ) -> Result<ExecutionInstance> {
        let mut fields = Map::new();
        fields.insert(field.to_string(), value);
        if let Some(started) = instance.started_at {
            let secs = (now - started).num_milliseconds() as f64 / 1000.0;
            fields.insert("execution_time_secs".into(), json!(secs));
        }
        self.ledger.update(&instance.id, Some(status), &fields, now)
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
