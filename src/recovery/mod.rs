//! Recovery module for the booking data store
//!
//! Provides:
//! - Restore engine (whole-store replace from a snapshot)
//! - Process control for service restarts and isolated workers
//! - The recovery-in-progress guard shared with the backup scheduler
//! - Recovery orchestration (RESTART → RESTORE → RESEED)

pub mod guard;
pub mod process;
pub mod restore;

pub use guard::{RecoveryGuard, RecoveryLease};
pub use process::{
    CommandSpec, ProcessController, ProcessHandle, ProcessOutput, ServiceCommands,
    SystemProcessController,
};
pub use restore::{RestoreEngine, RestoreReport};

use crate::health::{HealthMonitor, HealthVerdict};
use crate::logging::AuditLog;
use crate::metrics;
use crate::store::seed;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecoveryState {
    Healthy,
    Degraded,
    Recovering,
    Failed,
}

impl RecoveryState {
    pub const ALL: [RecoveryState; 4] = [
        RecoveryState::Healthy,
        RecoveryState::Degraded,
        RecoveryState::Recovering,
        RecoveryState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryState::Healthy => "HEALTHY",
            RecoveryState::Degraded => "DEGRADED",
            RecoveryState::Recovering => "RECOVERING",
            RecoveryState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strategy {
    Restart,
    Restore,
    Reseed,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Restart => "RESTART",
            Strategy::Restore => "RESTORE",
            Strategy::Reseed => "RESEED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAttempt {
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub detail: String,
}

/// Result of feeding one verdict to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing to do.
    AlreadyHealthy,
    Recovered,
    /// The pass ended in FAILED, or FAILED was already latched.
    Failed,
    /// Another pass is running.
    Ignored,
    /// A backup or a restore elsewhere held the recovery lease; the state is
    /// left DEGRADED for the next verdict.
    Deferred,
}

impl PassOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PassOutcome::AlreadyHealthy | PassOutcome::Recovered)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub service_name: String,
    pub restart_grace: Duration,
    /// Strategy executions allowed per pass.
    pub max_attempts: usize,
    pub seed_file: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            service_name: "postgresql".to_string(),
            restart_grace: Duration::from_secs(5),
            max_attempts: 3,
            seed_file: None,
        }
    }
}

/// Drives the store from an unhealthy verdict back to HEALTHY.
///
/// Strategies escalate RESTART → RESTORE → RESEED within a single pass.
/// Only one pass runs at a time; verdicts that arrive meanwhile are
/// dropped. FAILED latches until `reset`.
pub struct RecoveryOrchestrator {
    monitor: Arc<HealthMonitor>,
    restore: Arc<RestoreEngine>,
    process: Arc<dyn ProcessController>,
    audit: Arc<AuditLog>,
    config: OrchestratorConfig,
    state: Mutex<RecoveryState>,
    attempts: Mutex<Vec<RecoveryAttempt>>,
    shutdown: Notify,
}

impl RecoveryOrchestrator {
    pub fn new(
        monitor: Arc<HealthMonitor>,
        restore: Arc<RestoreEngine>,
        process: Arc<dyn ProcessController>,
        audit: Arc<AuditLog>,
        config: OrchestratorConfig,
    ) -> Self {
        metrics::set_orchestrator_state(RecoveryState::Healthy.as_str(), &state_labels());
        Self {
            monitor,
            restore,
            process,
            audit,
            config,
            state: Mutex::new(RecoveryState::Healthy),
            attempts: Mutex::new(Vec::new()),
            shutdown: Notify::new(),
        }
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.lock()
    }

    /// Every attempt made since construction, oldest first.
    pub fn attempts(&self) -> Vec<RecoveryAttempt> {
        self.attempts.lock().clone()
    }

    /// Operator acknowledgement of FAILED. The next verdict decides the state.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if *state == RecoveryState::Failed {
            self.audit.info("Operator reset: leaving FAILED");
            self.transition(&mut state, RecoveryState::Healthy);
        }
    }

    /// Poll once and run a full pass if the store is unhealthy.
    pub fn recover_once(&self) -> PassOutcome {
        let verdict = self.monitor.poll();
        self.handle_verdict(verdict)
    }

    /// Poll every `interval` and feed each verdict in, until `stop` is called.
    pub fn watch(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Health watch started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let orchestrator = self.clone();
                        match tokio::task::spawn_blocking(move || orchestrator.recover_once()).await {
                            Ok(PassOutcome::Recovered) => info!("Data store recovered"),
                            Ok(PassOutcome::Failed) => warn!("Data store needs operator attention"),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Recovery pass panicked"),
                        }
                    }
                    _ = self.shutdown.notified() => {
                        info!("Health watch stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    pub fn handle_verdict(&self, verdict: HealthVerdict) -> PassOutcome {
        let lease = {
            let mut state = self.state.lock();
            match *state {
                RecoveryState::Recovering => {
                    debug!("Recovery already running, verdict ignored");
                    return PassOutcome::Ignored;
                }
                RecoveryState::Failed => {
                    debug!("Orchestrator FAILED, waiting for operator reset");
                    return PassOutcome::Failed;
                }
                _ => {}
            }

            if verdict.is_healthy() {
                if *state != RecoveryState::Healthy {
                    self.transition(&mut state, RecoveryState::Healthy);
                }
                return PassOutcome::AlreadyHealthy;
            }

            self.audit.warn(&format!(
                "Unhealthy verdict: store_reachable={} integrity_ok={}",
                verdict.store_reachable, verdict.integrity_ok
            ));
            self.transition(&mut state, RecoveryState::Degraded);

            // Strategies run under the same lease as restores and backups.
            let Some(lease) = self.restore.guard().try_acquire() else {
                self.audit
                    .warn("Recovery deferred: another recovery operation is in progress");
                return PassOutcome::Deferred;
            };
            self.transition(&mut state, RecoveryState::Recovering);
            lease
        };

        let recovered = self.escalate(verdict, &lease);
        drop(lease);

        let mut state = self.state.lock();
        if recovered {
            self.transition(&mut state, RecoveryState::Healthy);
            PassOutcome::Recovered
        } else {
            self.audit
                .error("Automatic recovery failed, operator intervention required");
            self.transition(&mut state, RecoveryState::Failed);
            PassOutcome::Failed
        }
    }

    fn transition(&self, state: &mut RecoveryState, next: RecoveryState) {
        if *state == next {
            return;
        }
        self.audit
            .info(&format!("State transition: {} -> {}", state, next));
        *state = next;
        metrics::set_orchestrator_state(next.as_str(), &state_labels());
    }

    fn escalate(&self, initial: HealthVerdict, lease: &RecoveryLease) -> bool {
        let mut budget = self.config.max_attempts;

        if !initial.store_reachable {
            if !self.spend(&mut budget) {
                return false;
            }
            if self.try_restart().is_healthy() {
                return true;
            }
        }

        match self.restore.snapshots().latest() {
            Ok(Some(latest)) => {
                if !self.spend(&mut budget) {
                    return false;
                }
                if self.try_restore(lease, latest.stem()).is_healthy() {
                    return true;
                }
            }
            Ok(None) => self.audit.warn("No snapshot available, falling back to reseed"),
            Err(e) => self
                .audit
                .warn(&format!("Cannot list snapshots ({}), falling back to reseed", e)),
        }

        if !self.spend(&mut budget) {
            return false;
        }
        self.try_reseed(lease).is_healthy()
    }

    fn spend(&self, budget: &mut usize) -> bool {
        if *budget == 0 {
            self.audit.error(&format!(
                "Retry budget of {} attempts exhausted",
                self.config.max_attempts
            ));
            return false;
        }
        *budget -= 1;
        true
    }

    fn try_restart(&self) -> HealthVerdict {
        let started_at = Utc::now();
        self.audit
            .info(&format!("RESTART: restarting {}", self.config.service_name));

        let restarted = self.process.restart(&self.config.service_name);
        if !self.config.restart_grace.is_zero() {
            thread::sleep(self.config.restart_grace);
        }
        let verdict = self.monitor.poll();

        let (outcome, detail) = match restarted {
            Err(e) => (AttemptOutcome::Failure, e.to_string()),
            Ok(()) if verdict.store_reachable => (
                AttemptOutcome::Success,
                format!("{} reachable after restart", self.config.service_name),
            ),
            Ok(()) => (
                AttemptOutcome::Failure,
                format!("{} still unreachable after restart", self.config.service_name),
            ),
        };
        self.record(Strategy::Restart, started_at, outcome, detail);
        verdict
    }

    fn try_restore(&self, lease: &RecoveryLease, name: &str) -> HealthVerdict {
        let started_at = Utc::now();
        self.audit.info(&format!("RESTORE: restoring from {}", name));

        let restored = self.restore.restore_named_with(lease, name);
        let verdict = self.monitor.poll();

        let (outcome, detail) = match restored {
            Err(e) => (AttemptOutcome::Failure, e.to_string()),
            Ok(report) if verdict.is_healthy() => (
                AttemptOutcome::Success,
                format!(
                    "restored {} records from {}",
                    report.loaded.values().sum::<usize>(),
                    report.source
                ),
            ),
            Ok(report) => (
                AttemptOutcome::Failure,
                format!("store still unhealthy after restoring {}", report.source),
            ),
        };
        self.record(Strategy::Restore, started_at, outcome, detail);
        verdict
    }

    fn try_reseed(&self, lease: &RecoveryLease) -> HealthVerdict {
        let started_at = Utc::now();
        self.audit.info("RESEED: loading seed dataset");

        let reseeded = seed::load(self.config.seed_file.as_deref())
            .and_then(|snapshot| self.restore.restore_with(lease, &snapshot));
        let verdict = self.monitor.poll();

        let (outcome, detail) = match reseeded {
            Err(e) => (AttemptOutcome::Failure, e.to_string()),
            Ok(report) if verdict.is_healthy() => (
                AttemptOutcome::Success,
                format!("seeded {} records", report.loaded.values().sum::<usize>()),
            ),
            Ok(_) => (
                AttemptOutcome::Failure,
                "store still unhealthy after reseed".to_string(),
            ),
        };
        self.record(Strategy::Reseed, started_at, outcome, detail);
        verdict
    }

    fn record(
        &self,
        strategy: Strategy,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        detail: String,
    ) {
        let success = outcome == AttemptOutcome::Success;
        metrics::record_attempt(strategy.as_str(), success);
        let line = format!(
            "{} {}: {}",
            strategy.as_str(),
            if success { "succeeded" } else { "failed" },
            detail
        );
        if success {
            self.audit.info(&line);
        } else {
            self.audit.error(&line);
        }
        self.attempts.lock().push(RecoveryAttempt {
            strategy,
            started_at,
            outcome,
            detail,
        });
    }
}

fn state_labels() -> [&'static str; 4] {
    RecoveryState::ALL.map(|s| s.as_str())
}
