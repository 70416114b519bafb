//! Store doubles shared by the unit tests of the ledger's callers.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::{ExecutionLedger, LedgerSettings, LedgerStore, Page, RedbStore, View};
use crate::instance::ExecutionInstance;
use crate::retry::{RemoteError, RetryPolicy};

/// A redb store that refuses to scan the concurrency view of selected keys.
pub struct KeyFaultStore {
    inner: RedbStore,
    broken: Mutex<BTreeSet<String>>,
}

impl KeyFaultStore {
    pub fn open(path: &Path) -> Arc<Self> {
        Arc::new(KeyFaultStore {
            inner: RedbStore::open(path).unwrap(),
            broken: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn break_key(&self, key: &str) {
        self.broken.lock().unwrap().insert(key.to_string());
    }

    pub fn mend(&self) {
        self.broken.lock().unwrap().clear();
    }

    pub fn ledger(self: &Arc<Self>) -> ExecutionLedger {
        ExecutionLedger::new(self.clone(), LedgerSettings::default(), RetryPolicy::immediate(2))
    }
}

impl LedgerStore for KeyFaultStore {
    fn batch_put(&self, items: &[ExecutionInstance]) -> Result<Vec<ExecutionInstance>, RemoteError> {
        self.inner.batch_put(items)
    }

    fn get(&self, id: &str) -> Result<Option<ExecutionInstance>, RemoteError> {
        self.inner.get(id)
    }

    fn put(&self, item: &ExecutionInstance) -> Result<(), RemoteError> {
        self.inner.put(item)
    }

    fn merge(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&ExecutionInstance) -> Option<ExecutionInstance>,
    ) -> Result<Option<ExecutionInstance>, RemoteError> {
        self.inner.merge(id, apply)
    }

    fn scan(&self, view: &View, after: Option<&[u8]>, limit: usize) -> Result<Page, RemoteError> {
        if let View::Concurrency(key) = view {
            if self.broken.lock().unwrap().contains(key) {
                return Err(RemoteError::new("AccessDeniedException", format!("no access to {key}")));
            }
        }
        self.inner.scan(view, after, limit)
    }

    fn concurrency_keys(&self) -> Result<Vec<String>, RemoteError> {
        self.inner.concurrency_keys()
    }

    fn get_meta(&self, key: &str) -> Result<Option<Value>, RemoteError> {
        self.inner.get_meta(key)
    }

    fn put_meta(&self, key: &str, value: &Value) -> Result<(), RemoteError> {
        self.inner.put_meta(key, value)
    }
}
