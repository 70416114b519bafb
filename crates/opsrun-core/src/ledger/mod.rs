//! The execution ledger: the single source of truth for instance status.
//!
//! New records are buffered and written in batches; updates go straight to
//! the store (or patch the buffered record when it has not been flushed
//! yet). Every store call runs through a [`RetryExecutor`], so throttling
//! from a shared backing store is retried like any other remote call.
//!
//! Reads overlay the write buffer, so a caller always sees its own writes.
//! An update reads, checks and writes the stored record in one store
//! transaction, so a stale writer cannot move a record out of a terminal
//! status.

mod store;
#[cfg(test)]
pub(crate) mod testing;

pub use store::{LedgerStore, Page, RedbStore, View};

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OpsError, Result};
use crate::instance::{ExecutionInstance, InstanceStatus, TriggerSource};
use crate::retry::{CallStats, RetryExecutor, RetryPolicy};
use crate::task::{Target, Task};

const STORE_METHODS: &[&str] = &[
    "batch_put",
    "get",
    "put",
    "merge",
    "scan",
    "concurrency_keys",
    "get_meta",
    "put_meta",
];

const COMPLETION_TIMER: &str = "completion_timer";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Flush attempts for the same unprocessed item set before giving up.
    #[serde(default = "default_flush_attempts")]
    pub flush_attempts: u32,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_batch_size() -> usize {
    25
}

fn default_flush_attempts() -> u32 {
    5
}

fn default_page_size() -> usize {
    100
}

impl Default for LedgerSettings {
    fn default() -> Self {
        LedgerSettings {
            batch_size: default_batch_size(),
            flush_attempts: default_flush_attempts(),
            page_size: default_page_size(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionLedger
// ---------------------------------------------------------------------------

pub struct ExecutionLedger {
    store: RetryExecutor<Arc<dyn LedgerStore>>,
    settings: LedgerSettings,
    buffer: Mutex<Vec<ExecutionInstance>>,
}

impl ExecutionLedger {
    pub fn new(store: Arc<dyn LedgerStore>, settings: LedgerSettings, retry: RetryPolicy) -> Self {
        ExecutionLedger {
            store: RetryExecutor::new(store, STORE_METHODS.iter().copied(), retry),
            settings,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Open (or create) a redb-backed ledger at `path`. A file held by
    /// another process is waited on under `retry`, like a throttled call.
    pub fn open(path: &Path, settings: LedgerSettings, retry: RetryPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = RetryExecutor::new(path, ["open"], retry.clone())
            .call("open", |path| RedbStore::open(path))
            .map_err(|e| OpsError::Ledger(format!("{}: {e}", path.display())))?;
        Ok(Self::new(Arc::new(store), settings, retry))
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    fn buffer(&self) -> Result<MutexGuard<'_, Vec<ExecutionInstance>>> {
        self.buffer
            .lock()
            .map_err(|_| OpsError::Ledger("write buffer lock poisoned".into()))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Create a PENDING record for one firing of `task` against `target`.
    /// The record is buffered; a full buffer is flushed immediately.
    pub fn add(
        &self,
        task: &Task,
        target: &Target,
        resources: Value,
        source: TriggerSource,
        fired_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionInstance> {
        let definition = task.definition();
        let mut instance = ExecutionInstance::new_pending(
            task.name(),
            task.descriptor().id,
            &target.account,
            &target.region,
            source,
            now,
        );
        instance.fired_at = fired_at;
        instance.has_completion = task.descriptor().has_completion();
        instance.timeout_minutes = task.timeout_minutes();
        instance.concurrency_limit = task.concurrency_limit();
        instance.dry_run = definition.dry_run;
        instance.parameters = Value::Object(definition.parameters.clone());
        instance.resources = resources;

        let full = {
            let mut buffer = self.buffer()?;
            buffer.push(instance.clone());
            buffer.len() >= self.settings.batch_size
        };
        tracing::debug!(task = task.name(), instance = %instance.id, "instance created");
        if full {
            self.flush()?;
        }
        Ok(instance)
    }

    /// Drop records from the write buffer before they are written. Records
    /// already flushed are not touched. Returns how many were dropped.
    pub fn discard(&self, ids: &[&str]) -> Result<usize> {
        let mut buffer = self.buffer()?;
        let before = buffer.len();
        buffer.retain(|i| !ids.contains(&i.id.as_str()));
        let dropped = before - buffer.len();
        if dropped > 0 {
            tracing::debug!(dropped, "discarded buffered instances");
        }
        Ok(dropped)
    }

    /// Number of records waiting to be written.
    pub fn buffered(&self) -> usize {
        self.buffer().map(|b| b.len()).unwrap_or(0)
    }

    /// Write every buffered record in batches. Items the store leaves
    /// unprocessed are re-queued; when the same set comes back unprocessed
    /// `flush_attempts` times in a row, the remaining items are dropped and
    /// [`OpsError::PartialLedgerWrite`] is raised.
    pub fn flush(&self) -> Result<usize> {
        let mut pending = std::mem::take(&mut *self.buffer()?);
        let batch_size = self.settings.batch_size.max(1);
        let mut written = 0usize;
        let mut last_unprocessed: Option<BTreeSet<String>> = None;
        let mut attempts = 0u32;

        while !pending.is_empty() {
            let take = pending.len().min(batch_size);
            let batch: Vec<ExecutionInstance> = pending.drain(..take).collect();
            let unprocessed = match self.store.call("batch_put", |s| s.batch_put(&batch)) {
                Ok(unprocessed) => unprocessed,
                Err(e) => {
                    let mut buffer = self.buffer()?;
                    let newer = std::mem::take(&mut *buffer);
                    buffer.extend(batch);
                    buffer.extend(pending);
                    buffer.extend(newer);
                    return Err(e.into());
                }
            };
            written += batch.len() - unprocessed.len();
            if unprocessed.is_empty() {
                continue;
            }

            let ids: BTreeSet<String> = unprocessed.iter().map(|i| i.id.clone()).collect();
            if last_unprocessed.as_ref() == Some(&ids) {
                attempts += 1;
            } else {
                attempts = 1;
                last_unprocessed = Some(ids);
            }
            if attempts >= self.settings.flush_attempts {
                let lost = unprocessed.len() + pending.len();
                tracing::warn!(
                    unprocessed = lost,
                    attempts,
                    "giving up on ledger batch write"
                );
                return Err(OpsError::PartialLedgerWrite {
                    unprocessed: lost,
                    attempts,
                });
            }
            tracing::debug!(unprocessed = unprocessed.len(), attempts, "re-queueing unprocessed ledger items");
            pending.splice(0..0, unprocessed);
        }
        Ok(written)
    }

    /// Merge `fields` into the record and optionally move it to `status`.
    /// The stored record is read, checked and written in one transaction.
    /// A terminal record carries no concurrency or completion marker, so
    /// it drops out of both derived views.
    pub fn update(
        &self,
        id: &str,
        status: Option<InstanceStatus>,
        fields: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionInstance> {
        {
            let mut buffer = self.buffer()?;
            if let Some(slot) = buffer.iter_mut().find(|i| i.id == id) {
                let next = apply_update(slot, status, fields, now)?;
                *slot = next.clone();
                return Ok(next);
            }
        }
        let mut rejected = None;
        let merged = self.store.call("merge", |s| {
            s.merge(id, &mut |current| match apply_update(current, status, fields, now) {
                Ok(next) => Some(next),
                Err(e) => {
                    rejected = Some(e);
                    None
                }
            })
        })?;
        if let Some(e) = rejected {
            return Err(e);
        }
        let next = merged.ok_or_else(|| OpsError::InstanceNotFound(id.to_string()))?;
        if let Some(status) = status {
            tracing::debug!(instance = id, task = %next.task, %status, "instance updated");
        }
        Ok(next)
    }

    /// Shorthand for a status change with no extra fields.
    pub fn set_status(
        &self,
        id: &str,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<ExecutionInstance> {
        self.update(id, Some(status), &Map::new(), now)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn fetch(&self, id: &str) -> Result<Option<ExecutionInstance>> {
        Ok(self.store.call("get", |s| s.get(id))?)
    }

    pub fn get(&self, id: &str) -> Result<ExecutionInstance> {
        if let Some(buffered) = self.buffer()?.iter().find(|i| i.id == id) {
            return Ok(buffered.clone());
        }
        self.fetch(id)?
            .ok_or_else(|| OpsError::InstanceNotFound(id.to_string()))
    }

    /// Every record in `view`, page by page, with buffered records laid over
    /// the stored ones. Ordered by creation time.
    pub fn scan(&self, view: &View) -> Result<Vec<ExecutionInstance>> {
        let page_size = self.settings.page_size.max(1);
        let mut records: BTreeMap<String, ExecutionInstance> = BTreeMap::new();
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let page = self
                .store
                .call("scan", |s| s.scan(view, cursor.as_deref(), page_size))?;
            for item in page.items {
                records.insert(item.id.clone(), item);
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        for buffered in self.buffer()?.iter() {
            records.insert(buffered.id.clone(), buffered.clone());
        }
        let mut items: Vec<ExecutionInstance> =
            records.into_values().filter(|i| view.admits(i)).collect();
        items.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(items)
    }

    /// WAITING records for `key`, earliest created first.
    pub fn waiting_instances(&self, key: &str) -> Result<Vec<ExecutionInstance>> {
        Ok(self
            .scan(&View::Concurrency(key.to_string()))?
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Waiting)
            .collect())
    }

    /// Records occupying a slot for `key`, earliest created first.
    pub fn active_instances(&self, key: &str) -> Result<Vec<ExecutionInstance>> {
        Ok(self
            .scan(&View::Concurrency(key.to_string()))?
            .into_iter()
            .filter(|i| i.status.is_active())
            .collect())
    }

    pub fn active_count(&self, key: &str) -> Result<usize> {
        Ok(self.active_instances(key)?.len())
    }

    /// Records with a completion marker, any key or task. Terminal rows that
    /// still carry a marker are cleaned up and left out.
    pub fn instances_awaiting_completion(&self) -> Result<Vec<ExecutionInstance>> {
        let mut awaiting = Vec::new();
        for mut instance in self.scan(&View::AwaitingCompletion)? {
            if instance.status.is_terminal() {
                tracing::debug!(instance = %instance.id, status = %instance.status, "clearing stale completion marker");
                instance.last_completion_check = None;
                instance.concurrency_id = None;
                self.store.call("put", |s| s.put(&instance))?;
                continue;
            }
            awaiting.push(instance);
        }
        Ok(awaiting)
    }

    /// Records that still need admission (PENDING) or dispatch (STARTED but
    /// never executed).
    pub fn ready_instances(&self) -> Result<Vec<ExecutionInstance>> {
        self.scan(&View::Ready)
    }

    pub fn list(&self, status: Option<InstanceStatus>) -> Result<Vec<ExecutionInstance>> {
        Ok(self
            .scan(&View::All)?
            .into_iter()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .collect())
    }

    /// Keys currently holding at least one concurrency marker.
    pub fn concurrency_keys(&self) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = self
            .store
            .call("concurrency_keys", |s| s.concurrency_keys())?
            .into_iter()
            .collect();
        for buffered in self.buffer()?.iter() {
            if let Some(key) = &buffered.concurrency_id {
                keys.insert(key.clone());
            }
        }
        Ok(keys.into_iter().collect())
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    pub fn last_run(&self, task: &str) -> Result<Option<DateTime<Utc>>> {
        let key = format!("last_run:{task}");
        match self.store.call("get_meta", |s| s.get_meta(&key))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn set_last_run(&self, task: &str, at: DateTime<Utc>) -> Result<()> {
        let key = format!("last_run:{task}");
        let value = serde_json::to_value(at)?;
        Ok(self.store.call("put_meta", |s| s.put_meta(&key, &value))?)
    }

    pub fn completion_timer_armed(&self) -> Result<bool> {
        Ok(self
            .store
            .call("get_meta", |s| s.get_meta(COMPLETION_TIMER))?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub fn set_completion_timer(&self, armed: bool) -> Result<()> {
        Ok(self
            .store
            .call("put_meta", |s| s.put_meta(COMPLETION_TIMER, &Value::Bool(armed)))?)
    }

    pub fn retry_stats(&self) -> BTreeMap<String, CallStats> {
        self.store.stats()
    }

    pub fn reset_retry_stats(&self) {
        self.store.reset_stats();
    }

    /// Log the store calls that needed retries or failed since the last
    /// call, then start counting afresh.
    pub fn log_retry_stats(&self) {
        for (method, stats) in self.retry_stats() {
            if stats.retries > 0 || stats.failed > 0 || stats.timed_out > 0 {
                tracing::info!(
                    method = %method,
                    calls = stats.calls,
                    retries = stats.retries,
                    failed = stats.failed,
                    timed_out = stats.timed_out,
                    latency_ms = stats.latency_ms,
                    "ledger call stats"
                );
            }
        }
        self.reset_retry_stats();
    }
}

fn apply_update(
    current: &ExecutionInstance,
    status: Option<InstanceStatus>,
    fields: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<ExecutionInstance> {
    let mut next = current.merged(fields)?;
    if let Some(status) = status {
        current.status.check_transition(status)?;
        next.status = status;
    }
    if next.status.is_terminal() {
        next.concurrency_id = None;
        next.last_completion_check = None;
    }
    next.touch(now);
    Ok(next)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
