//! In-process backend with fault injection, used by tests and dry runs.

use super::{Collection, DataStore, Record};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct Inner {
    collections: HashMap<Collection, Vec<Record>>,
    reachable: bool,
    failing_pings: usize,
    failing_reads: HashSet<Collection>,
    failing_inserts: HashSet<Collection>,
    restore_pending: bool,
    pings: usize,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                reachable: true,
                ..Default::default()
            }),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// Make the next `n` pings fail, then recover on its own.
    pub fn fail_next_pings(&self, n: usize) {
        self.inner.lock().failing_pings = n;
    }

    pub fn fail_reads(&self, collection: Collection, fail: bool) {
        let mut inner = self.inner.lock();
        if fail {
            inner.failing_reads.insert(collection);
        } else {
            inner.failing_reads.remove(&collection);
        }
    }

    pub fn fail_inserts(&self, collection: Collection, fail: bool) {
        let mut inner = self.inner.lock();
        if fail {
            inner.failing_inserts.insert(collection);
        } else {
            inner.failing_inserts.remove(&collection);
        }
    }

    pub fn ping_count(&self) -> usize {
        self.inner.lock().pings
    }

    fn check_reachable(inner: &Inner) -> Result<()> {
        if inner.reachable {
            Ok(())
        } else {
            Err(Error::Connectivity("memory store offline".to_string()))
        }
    }
}

impl DataStore for MemoryStore {
    fn ping(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.pings += 1;
        if inner.failing_pings > 0 {
            inner.failing_pings -= 1;
            return Err(Error::Connectivity("injected ping failure".to_string()));
        }
        Self::check_reachable(&inner)
    }

    fn count(&self, collection: Collection) -> Result<usize> {
        let inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        Ok(inner.collections.get(&collection).map_or(0, Vec::len))
    }

    fn read_all(&self, collection: Collection) -> Result<Vec<Record>> {
        let inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        if inner.failing_reads.contains(&collection) {
            return Err(Error::Connectivity(format!("read of {} failed", collection)));
        }
        Ok(inner.collections.get(&collection).cloned().unwrap_or_default())
    }

    fn delete_all(&self, collection: Collection) -> Result<usize> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        Ok(inner.collections.remove(&collection).map_or(0, |v| v.len()))
    }

    fn insert_many(&self, collection: Collection, records: Vec<Record>) -> Result<usize> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        if inner.failing_inserts.contains(&collection) {
            return Err(Error::Io(std::io::Error::other(format!(
                "insert into {} rejected",
                collection
            ))));
        }
        let inserted = records.len();
        inner.collections.entry(collection).or_default().extend(records);
        Ok(inserted)
    }

    fn set_restore_pending(&self, pending: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        inner.restore_pending = pending;
        Ok(())
    }

    fn restore_pending(&self) -> Result<bool> {
        let inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        Ok(inner.restore_pending)
    }
}
