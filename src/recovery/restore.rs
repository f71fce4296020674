use super::{RecoveryGuard, RecoveryLease};
use crate::error::{Error, Result};
use crate::snapshot::{BackupMetadata, Snapshot, SnapshotStore};
use crate::store::{Collection, DataStore, RecordSchema};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// What a completed restore changed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub source: String,
    pub snapshot_timestamp: DateTime<Utc>,
    pub deleted: BTreeMap<Collection, usize>,
    pub loaded: BTreeMap<Collection, usize>,
    #[serde(skip)]
    pub duration: Duration,
}

/// Replaces the entire contents of the data store with a snapshot.
pub struct RestoreEngine {
    store: Arc<dyn DataStore>,
    snapshots: SnapshotStore,
    guard: RecoveryGuard,
}

impl RestoreEngine {
    pub fn new(store: Arc<dyn DataStore>, snapshots: SnapshotStore, guard: RecoveryGuard) -> Self {
        Self {
            store,
            snapshots,
            guard,
        }
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn guard(&self) -> &RecoveryGuard {
        &self.guard
    }

    /// Wipe every collection and load `snapshot` in its place.
    ///
    /// Holds the recovery lease throughout, so a second restore fails
    /// immediately and scheduled backups skip. The store stays marked
    /// restore-pending until the last collection has loaded; on failure the
    /// mark is left set and health polls report a failed integrity check.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<RestoreReport> {
        let lease = self.acquire()?;
        self.restore_with(&lease, snapshot)
    }

    /// Restore under a lease the caller already holds.
    pub fn restore_with(&self, lease: &RecoveryLease, snapshot: &Snapshot) -> Result<RestoreReport> {
        if !self.guard.issued(lease) {
            return Err(Error::Restore("lease was not issued by this engine's guard".into()));
        }

        let source = snapshot
            .path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "seed".to_string());
        info!(source = %source, "Starting restore");

        self.run(snapshot, source).map_err(|e| {
            error!(error = %e, "Restore failed");
            e.into_restore()
        })
    }

    fn acquire(&self) -> Result<RecoveryLease> {
        self.guard
            .try_acquire()
            .ok_or_else(|| Error::Restore("another recovery operation is in progress".into()))
    }

    fn run(&self, snapshot: &Snapshot, source: String) -> Result<RestoreReport> {
        let started = Instant::now();

        for collection in Collection::LOAD_ORDER {
            RecordSchema::for_collection(collection)
                .validate(snapshot.records(collection))
                .map_err(Error::Restore)?;
        }

        self.store.set_restore_pending(true)?;

        let mut deleted = BTreeMap::new();
        for collection in Collection::delete_order() {
            let n = self
                .store
                .delete_all(collection)
                .map_err(|e| Error::Restore(format!("clearing {}: {}", collection, e)))?;
            debug!(collection = %collection, removed = n, "Collection cleared");
            deleted.insert(collection, n);
        }

        let mut loaded = BTreeMap::new();
        for collection in Collection::LOAD_ORDER {
            let records = snapshot.records(collection).to_vec();
            let n = self
                .store
                .insert_many(collection, records)
                .map_err(|e| Error::Restore(format!("loading {}: {}", collection, e)))?;
            debug!(collection = %collection, inserted = n, "Collection loaded");
            loaded.insert(collection, n);
        }

        self.store.set_restore_pending(false)?;

        let report = RestoreReport {
            source,
            snapshot_timestamp: snapshot.created_at,
            deleted,
            loaded,
            duration: started.elapsed(),
        };
        info!(
            source = %report.source,
            records = report.loaded.values().sum::<usize>(),
            duration_ms = report.duration.as_millis() as u64,
            "Restore completed"
        );
        Ok(report)
    }

    /// Restore by filename or stem.
    pub fn restore_named(&self, name: &str) -> Result<RestoreReport> {
        let lease = self.acquire()?;
        self.restore_named_with(&lease, name)
    }

    pub fn restore_named_with(&self, lease: &RecoveryLease, name: &str) -> Result<RestoreReport> {
        let snapshot = self.snapshots.load(name).map_err(Error::into_restore)?;
        self.restore_with(lease, &snapshot)
    }

    /// Newest snapshot created at or before `target`.
    pub fn select_as_of(&self, target: DateTime<Utc>) -> Result<BackupMetadata> {
        self.snapshots
            .list()
            .map_err(Error::into_restore)?
            .into_iter()
            .find(|metadata| metadata.timestamp <= target)
            .ok_or_else(|| {
                Error::NoSnapshotAvailable(format!(
                    "no snapshot at or before {}",
                    target.to_rfc3339()
                ))
            })
    }

    /// Restore the newest snapshot created at or before `target` and return it.
    pub fn restore_as_of(&self, target: DateTime<Utc>) -> Result<Snapshot> {
        let metadata = self.select_as_of(target)?;
        info!(target = %target.to_rfc3339(), snapshot = %metadata.filename, "Point-in-time restore");
        let snapshot = self
            .snapshots
            .load(metadata.stem())
            .map_err(Error::into_restore)?;
        self.restore(&snapshot)?;
        Ok(snapshot)
    }
}
