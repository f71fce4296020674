pub mod backup;
pub mod cli;
pub mod config;
pub mod emergency;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod recovery;
pub mod runtime;
pub mod snapshot;
pub mod store;

pub use backup::{BackupScheduler, RetentionManager, RetentionPolicy, SnapshotListener};
pub use config::RecoveryConfig;
pub use emergency::{EmergencyServer, WorkerCommand};
pub use error::{Error, Result};
pub use health::{AnchorRule, HealthMonitor, HealthReport, HealthVerdict};
pub use logging::AuditLog;
pub use recovery::{
    PassOutcome, RecoveryAttempt, RecoveryGuard, RecoveryOrchestrator, RecoveryState,
    RestoreEngine, Strategy,
};
pub use runtime::RecoveryRuntime;
pub use snapshot::{BackupKind, BackupMetadata, Snapshot, SnapshotStore};
pub use store::{Collection, DataStore, FileStore, MemoryStore, Record};
