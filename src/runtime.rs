//! Component wiring shared by the binaries.

use crate::backup::{BackupScheduler, RetentionManager};
use crate::config::RecoveryConfig;
use crate::emergency::{ServiceContext, WorkerCommand};
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::logging::AuditLog;
use crate::recovery::guard::LOCK_FILE;
use crate::recovery::{
    ProcessController, RecoveryGuard, RecoveryOrchestrator, RestoreEngine,
    SystemProcessController,
};
use crate::snapshot::SnapshotStore;
use crate::store::{DataStore, FileStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct RecoveryRuntime {
    pub config: RecoveryConfig,
    pub store: Arc<dyn DataStore>,
    pub snapshots: SnapshotStore,
    pub guard: RecoveryGuard,
    pub audit: Arc<AuditLog>,
    pub process: Arc<dyn ProcessController>,
    pub monitor: Arc<HealthMonitor>,
    pub restore: Arc<RestoreEngine>,
}

impl RecoveryRuntime {
    /// Validate `config` and open the file-backed store, backup directory and audit log.
    ///
    /// Every process opened on the same data directory shares one recovery
    /// lock file there.
    pub fn open(config: RecoveryConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(FileStore::open(&config.paths.data_dir)?);
        let process = Arc::new(SystemProcessController::new(config.recovery.services.clone()));
        let audit = Arc::new(AuditLog::open(config.audit_log_path())?);
        let guard = RecoveryGuard::with_lock_file(config.paths.data_dir.join(LOCK_FILE));
        Self::assemble_with_guard(config, store, process, audit, guard)
    }

    /// Wire components around an already-open store with an in-process guard.
    pub fn assemble(
        config: RecoveryConfig,
        store: Arc<dyn DataStore>,
        process: Arc<dyn ProcessController>,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        Self::assemble_with_guard(config, store, process, audit, RecoveryGuard::new())
    }

    pub fn assemble_with_guard(
        config: RecoveryConfig,
        store: Arc<dyn DataStore>,
        process: Arc<dyn ProcessController>,
        audit: Arc<AuditLog>,
        guard: RecoveryGuard,
    ) -> Result<Self> {
        let snapshots = SnapshotStore::open(&config.paths.backup_dir)?;
        let monitor = Arc::new(HealthMonitor::new(store.clone(), config.health.anchors.clone()));
        let restore = Arc::new(RestoreEngine::new(
            store.clone(),
            snapshots.clone(),
            guard.clone(),
        ));
        debug!(
            data_dir = %config.paths.data_dir.display(),
            backup_dir = %config.paths.backup_dir.display(),
            "Recovery runtime assembled"
        );

        Ok(Self {
            config,
            store,
            snapshots,
            guard,
            audit,
            process,
            monitor,
            restore,
        })
    }

    pub fn retention(&self) -> RetentionManager {
        RetentionManager::new(self.snapshots.clone(), self.config.retention)
    }

    /// Scheduler with retention enforced after every snapshot.
    pub fn scheduler(&self) -> BackupScheduler {
        BackupScheduler::new(
            self.store.clone(),
            self.snapshots.clone(),
            self.guard.clone(),
            self.config.backup_interval(),
        )
        .with_listener(Arc::new(self.retention()))
    }

    pub fn orchestrator(&self) -> RecoveryOrchestrator {
        RecoveryOrchestrator::new(
            self.monitor.clone(),
            self.restore.clone(),
            self.process.clone(),
            self.audit.clone(),
            self.config.orchestrator_config(),
        )
    }

    pub fn emergency_context(&self, worker: WorkerCommand) -> ServiceContext {
        ServiceContext::new(
            self.snapshots.clone(),
            self.process.clone(),
            worker,
            self.audit.clone(),
            Duration::from_secs(self.config.emergency.worker_timeout_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::BackupKind;
    use crate::store::{seed, Collection, MemoryStore};
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_directories() {
        let dir = tempdir().unwrap();
        let mut config = RecoveryConfig::default();
        config.paths.data_dir = dir.path().join("data");
        config.paths.backup_dir = dir.path().join("backups");
        config.paths.log_dir = dir.path().join("logs");

        let runtime = RecoveryRuntime::open(config).unwrap();
        runtime.audit.info("opened");
        assert!(dir.path().join("data").is_dir());
        assert!(dir.path().join("backups").is_dir());
        assert!(dir.path().join("logs").join("db-recovery.log").is_file());
        assert_eq!(
            runtime.guard.lock_file(),
            Some(dir.path().join("data").join(LOCK_FILE).as_path())
        );
    }

    #[test]
    fn test_two_runtimes_on_one_data_dir_exclude_each_other() {
        let dir = tempdir().unwrap();
        let mut config = RecoveryConfig::default();
        config.paths.data_dir = dir.path().join("data");
        config.paths.backup_dir = dir.path().join("backups");
        config.paths.log_dir = dir.path().join("logs");

        let first = RecoveryRuntime::open(config.clone()).unwrap();
        let second = RecoveryRuntime::open(config).unwrap();

        let lease = first.guard.try_acquire().unwrap();
        assert!(second.restore.restore(&seed::baseline()).is_err());
        assert!(second.scheduler().create_snapshot(BackupKind::Manual).is_err());
        drop(lease);
        second.restore.restore(&seed::baseline()).unwrap();
        assert_eq!(second.store.count(Collection::Users).unwrap(), 2);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut config = RecoveryConfig::default();
        config.emergency.port = config.emergency.primary_port;
        assert!(RecoveryRuntime::open(config).is_err());
    }

    #[test]
    fn test_scheduler_enforces_retention() {
        let dir = tempdir().unwrap();
        let mut config = RecoveryConfig::default();
        config.paths.backup_dir = dir.path().to_path_buf();
        config.retention.max_count = 2;
        let store = Arc::new(MemoryStore::new());
        for (collection, records) in seed::baseline().collections {
            store.insert_many(collection, records).unwrap();
        }
        let runtime = RecoveryRuntime::assemble(
            config,
            store,
            Arc::new(SystemProcessController::default()),
            Arc::new(AuditLog::disabled()),
        )
        .unwrap();

        let scheduler = runtime.scheduler();
        for i in 1..=3 {
            scheduler
                .create_snapshot_named(&format!("backup-{}", i), BackupKind::Manual)
                .unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        let names: Vec<String> = runtime
            .snapshots
            .list()
            .unwrap()
            .iter()
            .map(|m| m.stem().to_string())
            .collect();
        assert_eq!(names, vec!["backup-3", "backup-2"]);
        assert_eq!(
            runtime.snapshots.latest().unwrap().unwrap().record_counts[&Collection::Hotels],
            1
        );
    }
}
