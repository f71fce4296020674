//! Periodic whole-store snapshots
//!
//! The scheduler captures every collection in dependency order, validates
//! the records, writes the snapshot and sidecar, then notifies registered
//! listeners (the retention manager) directly.

pub mod retention;

pub use retention::{RetentionManager, RetentionPolicy};

use crate::error::{Error, Result};
use crate::metrics;
use crate::recovery::{RecoveryGuard, RecoveryLease};
use crate::snapshot::{BackupKind, BackupMetadata, Snapshot, SnapshotStore};
use crate::store::{Collection, DataStore, RecordSchema};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Receives an event for every snapshot the scheduler writes.
pub trait SnapshotListener: Send + Sync {
    fn on_snapshot_created(&self, metadata: &BackupMetadata);
}

/// What a single scheduler tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Created(BackupMetadata),
    /// A restore held the recovery flag or left the store restore-pending.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub snapshots_created: u64,
    pub snapshots_failed: u64,
    pub ticks_skipped: u64,
    pub last_snapshot: Option<String>,
    pub last_duration: Duration,
}

pub struct BackupScheduler {
    store: Arc<dyn DataStore>,
    snapshots: SnapshotStore,
    guard: RecoveryGuard,
    interval: Duration,
    listeners: Vec<Arc<dyn SnapshotListener>>,
    stats: Mutex<SchedulerStats>,
    shutdown: Notify,
}

impl BackupScheduler {
    pub fn new(
        store: Arc<dyn DataStore>,
        snapshots: SnapshotStore,
        guard: RecoveryGuard,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            snapshots,
            guard,
            interval,
            listeners: Vec::new(),
            stats: Mutex::new(SchedulerStats::default()),
            shutdown: Notify::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn SnapshotListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().clone()
    }

    /// Snapshot the whole store under a timestamped name.
    pub fn create_snapshot(&self, kind: BackupKind) -> Result<Snapshot> {
        let name = SnapshotStore::timestamped_name(Utc::now());
        self.create_snapshot_named(&name, kind)
    }

    /// Snapshot the whole store under an explicit name.
    ///
    /// Any read, validation or write failure abandons the attempt with
    /// `Error::SnapshotWrite`; nothing usable is left on disk. Fails the same
    /// way while a restore is running or the store is restore-pending.
    pub fn create_snapshot_named(&self, name: &str, kind: BackupKind) -> Result<Snapshot> {
        let lease = match self.claim() {
            Ok(lease) => lease,
            Err(reason) => {
                metrics::record_snapshot(kind.as_str(), false, 0);
                self.stats.lock().snapshots_failed += 1;
                warn!(snapshot = %name, reason, "Snapshot refused");
                return Err(Error::SnapshotWrite(reason.to_string()));
            }
        };
        self.run_snapshot(&lease, name, kind).map(|(snapshot, _)| snapshot)
    }

    /// The recovery lease for one capture. Held until the snapshot is on disk,
    /// so no restore can change the store halfway through a capture.
    fn claim(&self) -> std::result::Result<RecoveryLease, &'static str> {
        let lease = self
            .guard
            .try_acquire()
            .ok_or("recovery in progress")?;
        if matches!(self.store.restore_pending(), Ok(true)) {
            return Err("store is restore-pending");
        }
        Ok(lease)
    }

    fn run_snapshot(
        &self,
        _lease: &RecoveryLease,
        name: &str,
        kind: BackupKind,
    ) -> Result<(Snapshot, BackupMetadata)> {
        let started = Instant::now();
        let kind_label = kind.as_str();

        let result = self.capture_and_write(name, kind);
        match &result {
            Ok((snapshot, metadata)) => {
                metrics::record_snapshot(kind_label, true, metadata.size);
                let mut stats = self.stats.lock();
                stats.snapshots_created += 1;
                stats.last_snapshot = Some(metadata.filename.clone());
                stats.last_duration = started.elapsed();
                drop(stats);

                info!(
                    snapshot = %metadata.filename,
                    size = metadata.size,
                    collections = snapshot.collections.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Snapshot created"
                );
                for listener in &self.listeners {
                    listener.on_snapshot_created(metadata);
                }
            }
            Err(e) => {
                metrics::record_snapshot(kind_label, false, 0);
                self.stats.lock().snapshots_failed += 1;
                error!(snapshot = %name, error = %e, "Snapshot failed");
            }
        }

        result
    }

    fn capture_and_write(&self, name: &str, kind: BackupKind) -> Result<(Snapshot, BackupMetadata)> {
        SnapshotStore::normalize_name(name)?;
        let created_at = Utc::now();

        let mut collections = BTreeMap::new();
        for collection in Collection::LOAD_ORDER {
            let records = self
                .store
                .read_all(collection)
                .map_err(|e| Error::SnapshotWrite(format!("reading {}: {}", collection, e)))?;
            RecordSchema::for_collection(collection)
                .validate(&records)
                .map_err(Error::SnapshotWrite)?;
            collections.insert(collection, records);
        }

        let mut snapshot = Snapshot::new(created_at, collections);
        let metadata = self
            .snapshots
            .write(name, &snapshot, kind)
            .map_err(Error::into_snapshot_write)?;
        snapshot.path = Some(self.snapshots.dir().join(&metadata.filename));
        snapshot.size = metadata.size;
        Ok((snapshot, metadata))
    }

    /// One scheduled backup. Skipped while a restore holds the recovery flag.
    pub fn tick(&self) -> TickOutcome {
        self.stats.lock().ticks += 1;

        let lease = match self.claim() {
            Ok(lease) => lease,
            Err(reason) => {
                self.stats.lock().ticks_skipped += 1;
                metrics::record_snapshot_skipped();
                warn!(reason, "Skipping scheduled backup");
                return TickOutcome::Skipped;
            }
        };

        let name = SnapshotStore::timestamped_name(Utc::now());
        match self.run_snapshot(&lease, &name, BackupKind::Scheduled) {
            Ok((_, metadata)) => TickOutcome::Created(metadata),
            Err(e) => TickOutcome::Failed(e.to_string()),
        }
    }

    /// Run immediately, then every `interval`, until `stop` is called.
    ///
    /// Each tick runs on the blocking pool so the timer task is never held
    /// up by disk I/O.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Backup scheduler started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let scheduler = self.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || scheduler.tick()).await {
                            error!(error = %e, "Backup worker panicked");
                        }
                    }
                    _ = self.shutdown.notified() => {
                        info!("Backup scheduler stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}
