//! Backing store for the execution ledger.
//!
//! # Table design
//!
//! `INSTANCES` maps an instance id to its JSON record. Four index tables
//! map composite keys back to ids, and are rewritten in the same write
//! transaction as the record:
//!
//! ```text
//! CREATED      [ created_ms: u64 BE | id ]                      every record
//! READY        [ created_ms: u64 BE | id ]                      pending, or started and not dispatched
//! COMPLETION   [ created_ms: u64 BE | id ]                      completion marker set
//! CONCURRENCY  [ key bytes | 0x00 | created_ms: u64 BE | id ]   concurrency marker set
//! ```
//!
//! Because the timestamp sits in the high bytes, byte order is creation
//! order within each index and every view is a single range scan.

use std::ops::Bound;
use std::path::Path;

use redb::{Database, DatabaseError, ReadableTable, TableDefinition, WriteTransaction};
use serde_json::Value;

use crate::instance::{ExecutionInstance, InstanceStatus};
use crate::retry::RemoteError;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");
const CREATED: TableDefinition<&[u8], &str> = TableDefinition::new("idx_created");
const READY: TableDefinition<&[u8], &str> = TableDefinition::new("idx_ready");
const COMPLETION: TableDefinition<&[u8], &str> = TableDefinition::new("idx_completion");
const CONCURRENCY: TableDefinition<&[u8], &str> = TableDefinition::new("idx_concurrency");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// A derived read view over the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    /// Records holding the concurrency marker for a key.
    Concurrency(String),
    /// Records with a completion marker set.
    AwaitingCompletion,
    /// Records that still need admission or dispatch.
    Ready,
    All,
}

impl View {
    /// Whether `instance` belongs in this view.
    pub fn admits(&self, instance: &ExecutionInstance) -> bool {
        match self {
            View::Concurrency(key) => instance.concurrency_id.as_deref() == Some(key.as_str()),
            View::AwaitingCompletion => instance.last_completion_check.is_some(),
            View::Ready => is_ready(instance),
            View::All => true,
        }
    }
}

fn is_ready(instance: &ExecutionInstance) -> bool {
    match instance.status {
        InstanceStatus::Pending => true,
        InstanceStatus::Started => !instance.is_dispatched(),
        _ => false,
    }
}

/// One page of a view scan. `next` is the cursor to pass back for the
/// following page, absent on the last one.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<ExecutionInstance>,
    pub next: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

/// Storage the ledger runs on. Errors are reported as [`RemoteError`] so the
/// ledger can classify and retry them like any other remote call.
pub trait LedgerStore: Send + Sync {
    /// Write a batch. Returns the items that were not processed.
    fn batch_put(&self, items: &[ExecutionInstance]) -> Result<Vec<ExecutionInstance>, RemoteError>;

    fn get(&self, id: &str) -> Result<Option<ExecutionInstance>, RemoteError>;

    fn put(&self, item: &ExecutionInstance) -> Result<(), RemoteError>;

    /// Read, change and write one record in a single transaction. `apply`
    /// sees the stored record and returns its replacement, or `None` to
    /// leave it untouched. Returns the written record, or `None` when the
    /// record is missing or `apply` declined.
    fn merge(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&ExecutionInstance) -> Option<ExecutionInstance>,
    ) -> Result<Option<ExecutionInstance>, RemoteError>;

    fn scan(&self, view: &View, after: Option<&[u8]>, limit: usize) -> Result<Page, RemoteError>;

    /// Distinct keys currently holding at least one concurrency marker.
    fn concurrency_keys(&self) -> Result<Vec<String>, RemoteError>;

    fn get_meta(&self, key: &str) -> Result<Option<Value>, RemoteError>;

    fn put_meta(&self, key: &str, value: &Value) -> Result<(), RemoteError>;
}

fn store_err(e: impl std::fmt::Display) -> RemoteError {
    RemoteError::new("LedgerStoreError", e.to_string())
}

/// Another process holds the database file. Classified as transient.
pub const LEDGER_BUSY: &str = "LedgerBusy";

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn created_key(instance: &ExecutionInstance) -> Vec<u8> {
    let ms = instance.created_ms().max(0) as u64;
    let mut key = Vec::with_capacity(8 + instance.id.len());
    key.extend_from_slice(&ms.to_be_bytes());
    key.extend_from_slice(instance.id.as_bytes());
    key
}

fn concurrency_prefix(key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(key.len() + 1);
    prefix.extend_from_slice(key.as_bytes());
    prefix.push(0x00);
    prefix
}

fn concurrency_index_key(key: &str, instance: &ExecutionInstance) -> Vec<u8> {
    let mut full = concurrency_prefix(key);
    full.extend_from_slice(&created_key(instance));
    full
}

/// Every index entry `instance` should have, paired with its table.
fn index_entries(
    instance: &ExecutionInstance,
) -> Vec<(TableDefinition<'static, &'static [u8], &'static str>, Vec<u8>)> {
    let mut entries = vec![(CREATED, created_key(instance))];
    if is_ready(instance) {
        entries.push((READY, created_key(instance)));
    }
    if instance.last_completion_check.is_some() {
        entries.push((COMPLETION, created_key(instance)));
    }
    if let Some(key) = &instance.concurrency_id {
        entries.push((CONCURRENCY, concurrency_index_key(key, instance)));
    }
    entries
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

/// Ledger store on a local redb file.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self, RemoteError> {
        let db = match Database::create(path) {
            Ok(db) => db,
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                return Err(RemoteError::new(LEDGER_BUSY, "ledger is open in another process"))
            }
            Err(e) => return Err(store_err(e)),
        };
        let wt = db.begin_write().map_err(store_err)?;
        {
            wt.open_table(INSTANCES).map_err(store_err)?;
            wt.open_table(META).map_err(store_err)?;
            for index in [CREATED, READY, COMPLETION, CONCURRENCY] {
                wt.open_table(index).map_err(store_err)?;
            }
        }
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    fn write_all(&self, items: &[ExecutionInstance]) -> Result<(), RemoteError> {
        let wt = self.db.begin_write().map_err(store_err)?;
        for item in items {
            write_record(&wt, item)?;
        }
        wt.commit().map_err(store_err)
    }
}

fn read_record(wt: &WriteTransaction, id: &str) -> Result<Option<ExecutionInstance>, RemoteError> {
    let instances = wt.open_table(INSTANCES).map_err(store_err)?;
    let record = match instances.get(id).map_err(store_err)? {
        Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(store_err)?),
        None => None,
    };
    Ok(record)
}

/// Replace the record and move its index entries to match.
fn write_record(wt: &WriteTransaction, item: &ExecutionInstance) -> Result<(), RemoteError> {
    if let Some(old) = read_record(wt, &item.id)? {
        for (table, key) in index_entries(&old) {
            let mut index = wt.open_table(table).map_err(store_err)?;
            index.remove(key.as_slice()).map_err(store_err)?;
        }
    }
    for (table, key) in index_entries(item) {
        let mut index = wt.open_table(table).map_err(store_err)?;
        index
            .insert(key.as_slice(), item.id.as_str())
            .map_err(store_err)?;
    }
    let value = serde_json::to_vec(item).map_err(store_err)?;
    let mut instances = wt.open_table(INSTANCES).map_err(store_err)?;
    instances
        .insert(item.id.as_str(), value.as_slice())
        .map_err(store_err)?;
    Ok(())
}

impl LedgerStore for RedbStore {
    fn batch_put(&self, items: &[ExecutionInstance]) -> Result<Vec<ExecutionInstance>, RemoteError> {
        self.write_all(items)?;
        Ok(Vec::new())
    }

    fn get(&self, id: &str) -> Result<Option<ExecutionInstance>, RemoteError> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(INSTANCES).map_err(store_err)?;
        match table.get(id).map_err(store_err)? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(store_err)?,
            )),
            None => Ok(None),
        }
    }

    fn put(&self, item: &ExecutionInstance) -> Result<(), RemoteError> {
        self.write_all(std::slice::from_ref(item))
    }

    fn merge(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&ExecutionInstance) -> Option<ExecutionInstance>,
    ) -> Result<Option<ExecutionInstance>, RemoteError> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let next = match read_record(&wt, id)? {
            Some(current) => apply(&current),
            None => None,
        };
        let Some(next) = next else {
            wt.abort().map_err(store_err)?;
            return Ok(None);
        };
        write_record(&wt, &next)?;
        wt.commit().map_err(store_err)?;
        Ok(Some(next))
    }

    fn scan(&self, view: &View, after: Option<&[u8]>, limit: usize) -> Result<Page, RemoteError> {
        let (table_def, lower, upper) = match view {
            View::All => (CREATED, Vec::new(), None),
            View::Ready => (READY, Vec::new(), None),
            View::AwaitingCompletion => (COMPLETION, Vec::new(), None),
            View::Concurrency(key) => {
                let lower = concurrency_prefix(key);
                let mut upper = key.as_bytes().to_vec();
                upper.push(0x01);
                (CONCURRENCY, lower, Some(upper))
            }
        };
        let start = match after {
            Some(cursor) => Bound::Excluded(cursor),
            None => Bound::Included(lower.as_slice()),
        };
        let end = match &upper {
            Some(upper) => Bound::Excluded(upper.as_slice()),
            None => Bound::Unbounded,
        };

        let rt = self.db.begin_read().map_err(store_err)?;
        let index = rt.open_table(table_def).map_err(store_err)?;
        let instances = rt.open_table(INSTANCES).map_err(store_err)?;

        let mut page = Page::default();
        let mut last_key = None;
        for entry in index.range::<&[u8]>((start, end)).map_err(store_err)? {
            if page.items.len() == limit {
                page.next = last_key.take();
                break;
            }
            let (k, id) = entry.map_err(store_err)?;
            last_key = Some(k.value().to_vec());
            // Index rows without a record are skipped; the record is the truth.
            if let Some(guard) = instances.get(id.value()).map_err(store_err)? {
                let instance: ExecutionInstance =
                    serde_json::from_slice(guard.value()).map_err(store_err)?;
                page.items.push(instance);
            }
        }
        Ok(page)
    }

    fn concurrency_keys(&self) -> Result<Vec<String>, RemoteError> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let index = rt.open_table(CONCURRENCY).map_err(store_err)?;
        let mut keys: Vec<String> = Vec::new();
        for entry in index.iter().map_err(store_err)? {
            let (k, _) = entry.map_err(store_err)?;
            let bytes = k.value();
            let end = bytes.iter().position(|b| *b == 0x00).unwrap_or(bytes.len());
            let key = String::from_utf8_lossy(&bytes[..end]).into_owned();
            if keys.last() != Some(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn get_meta(&self, key: &str) -> Result<Option<Value>, RemoteError> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(META).map_err(store_err)?;
        match table.get(key).map_err(store_err)? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(store_err)?,
            )),
            None => Ok(None),
        }
    }

    fn put_meta(&self, key: &str, value: &Value) -> Result<(), RemoteError> {
        let bytes = serde_json::to_vec(value).map_err(store_err)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(META).map_err(store_err)?;
            table.insert(key, bytes.as_slice()).map_err(store_err)?;
        }
        wt.commit().map_err(store_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::TriggerSource;
    use crate::retry::{classify, ErrorClass};
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("ledger.redb")).unwrap();
        (dir, store)
    }

    fn instance(offset_secs: i64) -> ExecutionInstance {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap() + Duration::seconds(offset_secs);
        ExecutionInstance::new_pending("nightly", "noop", "111", "eu-west-1", TriggerSource::Schedule, at)
    }

    #[test]
    fn views_follow_record_changes() {
        let (_dir, store) = open_tmp();
        let mut inst = instance(0);
        store.put(&inst).unwrap();
        assert_eq!(store.scan(&View::Ready, None, 10).unwrap().items.len(), 1);

        inst.status = InstanceStatus::WaitForCompletion;
        inst.started_at = Some(inst.created_at);
        inst.concurrency_id = Some("snap:111".into());
        inst.last_completion_check = Some(inst.created_at);
        store.put(&inst).unwrap();
        assert!(store.scan(&View::Ready, None, 10).unwrap().items.is_empty());
        assert_eq!(store.scan(&View::AwaitingCompletion, None, 10).unwrap().items.len(), 1);
        assert_eq!(
            store.scan(&View::Concurrency("snap:111".into()), None, 10).unwrap().items[0].id,
            inst.id
        );

        inst.status = InstanceStatus::Completed;
        inst.concurrency_id = None;
        inst.last_completion_check = None;
        store.put(&inst).unwrap();
        assert!(store.scan(&View::AwaitingCompletion, None, 10).unwrap().items.is_empty());
        assert!(store.concurrency_keys().unwrap().is_empty());
        assert_eq!(store.scan(&View::All, None, 10).unwrap().items.len(), 1);
    }

    #[test]
    fn pages_are_in_creation_order() {
        let (_dir, store) = open_tmp();
        let items: Vec<_> = (0..5).rev().map(instance).collect();
        store.batch_put(&items).unwrap();

        let first = store.scan(&View::All, None, 2).unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next.clone().unwrap();
        let second = store.scan(&View::All, Some(&cursor), 2).unwrap();
        let third = store.scan(&View::All, second.next.as_deref(), 2).unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.next.is_none());

        let created: Vec<_> = first
            .items
            .iter()
            .chain(&second.items)
            .chain(&third.items)
            .map(|i| i.created_at)
            .collect();
        let mut sorted = created.clone();
        sorted.sort();
        assert_eq!(created, sorted);
    }

    #[test]
    fn concurrency_views_do_not_bleed_across_prefixes() {
        let (_dir, store) = open_tmp();
        let mut a = instance(0);
        a.concurrency_id = Some("key".into());
        let mut b = instance(1);
        b.concurrency_id = Some("key-2".into());
        store.batch_put(&[a.clone(), b]).unwrap();

        let page = store.scan(&View::Concurrency("key".into()), None, 10).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, a.id);
        assert_eq!(store.concurrency_keys().unwrap(), vec!["key", "key-2"]);
    }

    #[test]
    fn meta_roundtrip_and_missing_records() {
        let (_dir, store) = open_tmp();
        assert!(store.get("missing").unwrap().is_none());
        assert!(store.get_meta("last_run:nightly").unwrap().is_none());
        store
            .put_meta("last_run:nightly", &serde_json::json!("2024-05-01T02:00:00Z"))
            .unwrap();
        assert_eq!(
            store.get_meta("last_run:nightly").unwrap(),
            Some(serde_json::json!("2024-05-01T02:00:00Z"))
        );
    }

    #[test]
    fn merge_rewrites_record_and_indexes_together() {
        let (_dir, store) = open_tmp();
        let mut inst = instance(0);
        inst.concurrency_id = Some("k".into());
        store.put(&inst).unwrap();

        let merged = store
            .merge(&inst.id, &mut |current| {
                let mut next = current.clone();
                next.status = InstanceStatus::Completed;
                next.concurrency_id = None;
                Some(next)
            })
            .unwrap()
            .unwrap();
        assert_eq!(merged.status, InstanceStatus::Completed);
        assert!(store.concurrency_keys().unwrap().is_empty());
        assert!(store.scan(&View::Ready, None, 10).unwrap().items.is_empty());

        let declined = store.merge(&inst.id, &mut |_| None).unwrap();
        assert!(declined.is_none());
        assert_eq!(store.get(&inst.id).unwrap().unwrap().status, InstanceStatus::Completed);

        let mut called = false;
        let missing = store
            .merge("missing", &mut |current| {
                called = true;
                Some(current.clone())
            })
            .unwrap();
        assert!(missing.is_none());
        assert!(!called);
    }

    #[test]
    fn second_open_reports_a_busy_ledger() {
        let (dir, _store) = open_tmp();
        let err = match RedbStore::open(&dir.path().join("ledger.redb")) {
            Err(e) => e,
            Ok(_) => panic!("the file is already held"),
        };
        assert_eq!(err.code, LEDGER_BUSY);
        assert_eq!(classify(&err), ErrorClass::Transient);
    }
}
