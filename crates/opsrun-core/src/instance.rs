use crate::error::{OpsError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// InstanceStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    Pending,
    Waiting,
    Started,
    WaitForCompletion,
    Completed,
    Failed,
    TimedOut,
}

impl InstanceStatus {
    pub fn all() -> &'static [InstanceStatus] {
        &[
            InstanceStatus::Pending,
            InstanceStatus::Waiting,
            InstanceStatus::Started,
            InstanceStatus::WaitForCompletion,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::TimedOut,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Waiting => "waiting",
            InstanceStatus::Started => "started",
            InstanceStatus::WaitForCompletion => "wait-for-completion",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::TimedOut => "timed-out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::TimedOut
        )
    }

    /// Admitted and not yet finished; these occupy a concurrency slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            InstanceStatus::Started | InstanceStatus::WaitForCompletion
        )
    }

    /// Allowed moves. A status may always be re-written with itself to
    /// refresh fields, except once terminal. `Started -> Waiting` is only
    /// used to requeue an over-admitted instance that never ran.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Waiting)
                | (Pending, Started)
                | (Pending, Failed)
                | (Waiting, Started)
                | (Waiting, Failed)
                | (Started, Waiting)
                | (Started, WaitForCompletion)
                | (Started, Completed)
                | (Started, Failed)
                | (WaitForCompletion, Completed)
                | (WaitForCompletion, Failed)
                | (WaitForCompletion, TimedOut)
        )
    }

    pub fn check_transition(self, next: InstanceStatus) -> Result<()> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        let reason = if self.is_terminal() {
            "terminal statuses never change".to_string()
        } else {
            "not a permitted transition".to_string()
        };
        Err(OpsError::InvalidTransition {
            from: self.to_string(),
            to: next.to_string(),
            reason,
        })
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self> {
        InstanceStatus::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| OpsError::Configuration(format!("unknown instance status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Trigger source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Event,
    Manual,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Schedule => "schedule",
            TriggerSource::Event => "event",
            TriggerSource::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionInstance
// ---------------------------------------------------------------------------

/// One firing of a task. Fields not modelled here survive in `extra`, so
/// arbitrary merged fields round-trip through the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInstance {
    pub id: String,
    pub task: String,
    pub action: String,
    pub account: String,
    pub region: String,
    pub status: InstanceStatus,
    pub source: TriggerSource,
    pub created_at: DateTime<Utc>,
    pub created_ts: i64,
    pub updated_at: DateTime<Utc>,
    pub updated_ts: i64,
    /// The minute the task was due, in UTC.
    pub fired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_key: Option<String>,
    /// Index copy of `concurrency_key`; cleared on terminal transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u32>,
    #[serde(default)]
    pub has_completion: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
    /// Set when the action's execute() was invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion marker; present only while waiting for completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completion_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_secs: Option<f64>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub resources: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecutionInstance {
    pub fn new_pending(
        task: impl Into<String>,
        action: impl Into<String>,
        account: impl Into<String>,
        region: impl Into<String>,
        source: TriggerSource,
        now: DateTime<Utc>,
    ) -> Self {
        ExecutionInstance {
            id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            action: action.into(),
            account: account.into(),
            region: region.into(),
            status: InstanceStatus::Pending,
            source,
            created_at: now,
            created_ts: now.timestamp(),
            updated_at: now,
            updated_ts: now.timestamp(),
            fired_at: now,
            concurrency_key: None,
            concurrency_id: None,
            concurrency_limit: None,
            has_completion: false,
            dry_run: false,
            timeout_minutes: None,
            started_at: None,
            last_completion_check: None,
            start_result: None,
            result: None,
            error: None,
            execution_time_secs: None,
            parameters: Value::Null,
            resources: Value::Null,
            extra: Map::new(),
        }
    }

    /// Point after which the instance is forced to `timed-out`.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.timeout_minutes
            .map(|m| self.created_at + Duration::minutes(i64::from(m)))
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline().is_some_and(|d| now > d)
    }

    pub fn is_dispatched(&self) -> bool {
        self.started_at.is_some()
    }

    /// Milliseconds since the epoch, used for creation ordering.
    pub fn created_ms(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    /// Merge `fields` into the record: `null` removes a field, anything else
    /// replaces it. `id` and `created_*` are fixed at creation, and `status`
    /// only moves through the ledger's checked transitions.
    pub fn merged(&self, fields: &Map<String, Value>) -> Result<ExecutionInstance> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            for (key, v) in fields {
                if matches!(key.as_str(), "id" | "status" | "created_at" | "created_ts") {
                    continue;
                }
                if v.is_null() {
                    map.remove(key);
                } else {
                    map.insert(key.clone(), v.clone());
                }
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.updated_ts = now.timestamp();
    }
}
