//! Runtime configuration
//!
//! Precedence, lowest first: built-in defaults, the JSON file given with
//! `--config`, `RSV_*` environment variables, command-line flags.

use crate::backup::RetentionPolicy;
use crate::error::{Error, Result};
use crate::health::{default_anchors, AnchorRule};
use crate::recovery::{OrchestratorConfig, ServiceCommands};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const AUDIT_LOG_FILE: &str = "db-recovery.log";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub paths: PathsConfig,
    pub backup: BackupConfig,
    pub retention: RetentionPolicy,
    pub health: HealthConfig,
    pub recovery: RecoverySettings,
    pub emergency: EmergencyConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            backup_dir: PathBuf::from("./backups"),
            log_dir: PathBuf::from("./logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub interval_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600, // 1 hour
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub poll_interval_secs: u64,
    pub anchors: Vec<AnchorRule>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            anchors: default_anchors(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub service_name: String,
    pub restart_grace_secs: u64,
    pub max_attempts: usize,
    pub seed_file: Option<PathBuf>,
    /// Stop/start shell commands per service name.
    pub services: HashMap<String, ServiceCommands>,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            service_name: "postgresql".to_string(),
            restart_grace_secs: 5,
            max_attempts: 3,
            seed_file: None,
            services: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    pub host: String,
    pub port: u16,
    /// Port of the primary application, which the emergency service must not share.
    pub primary_port: u16,
    pub worker_timeout_secs: u64,
    /// Worker binary; defaults to `rsv-recovery` next to the running executable.
    pub worker_binary: Option<PathBuf>,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4901,
            primary_port: 4900,
            worker_timeout_secs: 600,
            worker_binary: None,
        }
    }
}

impl RecoveryConfig {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("RSV_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RSV_BACKUP_DIR") {
            self.paths.backup_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RSV_LOG_DIR") {
            self.paths.log_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("RSV_EMERGENCY_PORT") {
            self.emergency.port = parse_port("RSV_EMERGENCY_PORT", &port)?;
        }
        if let Some(port) = lookup("RSV_PRIMARY_PORT") {
            self.emergency.primary_port = parse_port("RSV_PRIMARY_PORT", &port)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention.max_count == 0 {
            return Err(Error::Config("retention.max_count must be at least 1".into()));
        }
        if self.backup.interval_secs == 0 {
            return Err(Error::Config("backup.interval_secs must be positive".into()));
        }
        if self.health.poll_interval_secs == 0 {
            return Err(Error::Config("health.poll_interval_secs must be positive".into()));
        }
        if self.recovery.max_attempts == 0 {
            return Err(Error::Config("recovery.max_attempts must be at least 1".into()));
        }
        if self.emergency.worker_timeout_secs == 0 {
            return Err(Error::Config(
                "emergency.worker_timeout_secs must be positive".into(),
            ));
        }
        if self.emergency.port == self.emergency.primary_port {
            return Err(Error::Config(format!(
                "emergency port {} collides with the primary application port",
                self.emergency.port
            )));
        }
        Ok(())
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.paths.log_dir.join(AUDIT_LOG_FILE)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup.interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.poll_interval_secs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            service_name: self.recovery.service_name.clone(),
            restart_grace: Duration::from_secs(self.recovery.restart_grace_secs),
            max_attempts: self.recovery.max_attempts,
            seed_file: self.recovery.seed_file.clone(),
        }
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{}: invalid port '{}'", key, value)))
}
