//! Count and size budgets over the snapshot directory.

use super::SnapshotListener;
use crate::error::Error;
use crate::metrics;
use crate::snapshot::{BackupMetadata, SnapshotStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_total_bytes: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: 24,
            max_total_bytes: 100 * 1024 * 1024, // 100MB
        }
    }
}

pub struct RetentionManager {
    snapshots: SnapshotStore,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(snapshots: SnapshotStore, policy: RetentionPolicy) -> Self {
        Self { snapshots, policy }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Apply the count rule, then the size rule, and return what was evicted.
    ///
    /// The newest snapshot is never evicted, even when it alone exceeds
    /// `max_total_bytes`. I/O failures are logged and skipped. Sidecars left
    /// behind by removed data files are cleaned up on the way out.
    pub fn enforce(&self, policy: &RetentionPolicy) -> Vec<BackupMetadata> {
        let backups = match self.snapshots.list() {
            Ok(backups) => backups,
            Err(e) => {
                warn!(error = %Error::Retention(e.to_string()), "Cannot list snapshots");
                return Vec::new();
            }
        };

        let mut evicted = Vec::new();
        let survivors = self.apply_count_rule(backups, policy.max_count.max(1), &mut evicted);

        // Size rule: drop the oldest until under budget, never the newest.
        let mut total: u64 = survivors.iter().map(|m| m.size).sum();
        debug!(total_bytes = total, budget = policy.max_total_bytes, "Retention size check");
        let mut idx = survivors.len();
        while total > policy.max_total_bytes && idx > 1 {
            idx -= 1;
            let metadata = &survivors[idx];
            if self.evict(metadata, "size") {
                total = total.saturating_sub(metadata.size);
                evicted.push(metadata.clone());
            }
        }

        self.remove_orphan_sidecars();

        if !evicted.is_empty() {
            info!(
                evicted = evicted.len(),
                remaining_bytes = total,
                "Retention enforced"
            );
        }
        evicted
    }

    /// Everything past the newest `keep` goes, oldest first. Snapshots that
    /// could not be deleted stay in the returned list, which keeps the
    /// newest-first order of `backups`.
    fn apply_count_rule(
        &self,
        mut backups: Vec<BackupMetadata>,
        keep: usize,
        evicted: &mut Vec<BackupMetadata>,
    ) -> Vec<BackupMetadata> {
        if backups.len() <= keep {
            return backups;
        }
        let excess = backups.split_off(keep);
        let mut failed = Vec::new();
        for metadata in excess.into_iter().rev() {
            if self.evict(&metadata, "count") {
                evicted.push(metadata);
            } else {
                failed.push(metadata);
            }
        }
        backups.extend(failed.into_iter().rev());
        backups
    }

    fn remove_orphan_sidecars(&self) {
        let orphans = match self.snapshots.orphan_sidecars() {
            Ok(orphans) => orphans,
            Err(e) => {
                warn!(error = %Error::Retention(e.to_string()), "Cannot scan for orphan sidecars");
                return;
            }
        };
        for stem in orphans {
            match self.snapshots.remove_orphan_sidecar(&stem) {
                Ok(true) => info!(snapshot = %stem, "Removed orphan sidecar"),
                Ok(false) => {}
                Err(e) => warn!(
                    snapshot = %stem,
                    error = %Error::Retention(e.to_string()),
                    "Cannot remove orphan sidecar"
                ),
            }
        }
    }

    /// A snapshot that is already gone counts as evicted.
    fn evict(&self, metadata: &BackupMetadata, rule: &str) -> bool {
        match self.snapshots.delete(metadata.stem()) {
            Ok(_) => {
                metrics::record_eviction(rule, true);
                info!(snapshot = %metadata.filename, rule, "Evicted snapshot");
                true
            }
            Err(e) => {
                metrics::record_eviction(rule, false);
                warn!(
                    snapshot = %metadata.filename,
                    error = %Error::Retention(e.to_string()),
                    "Eviction failed"
                );
                false
            }
        }
    }
}

impl SnapshotListener for RetentionManager {
    fn on_snapshot_created(&self, _metadata: &BackupMetadata) {
        self.enforce(&self.policy);
    }
}
