use crate::error::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Initialize process logging. Safe to call more than once; later calls are ignored.
pub fn init_logging(level: Level, json_output: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rsvshop_recovery={},warn", level)));

    let result = if json_output {
        let fmt_layer = fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_names(true)
            .with_writer(std::io::stderr);

        Registry::default().with(env_filter).with(fmt_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_timer(SystemTime)
            .with_target(false)
            .with_writer(std::io::stderr);

        Registry::default().with(env_filter).with(fmt_layer).try_init()
    };

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

impl AuditLevel {
    fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Info => "INFO",
            AuditLevel::Warn => "WARN",
            AuditLevel::Error => "ERROR",
        }
    }
}

/// Durable, append-only recovery log.
///
/// Every line is `[<timestamp>] [<LEVEL>] <message>` and is mirrored to
/// `tracing`. Write failures are reported through `tracing` and otherwise
/// ignored so that logging can never abort a recovery.
pub struct AuditLog {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path: Some(path),
            file: Mutex::new(Some(file)),
        })
    }

    /// Only mirrors to `tracing`.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, level: AuditLevel, message: &str) {
        match level {
            AuditLevel::Info => info!(target: "rsvshop_recovery::audit", "{}", message),
            AuditLevel::Warn => warn!(target: "rsvshop_recovery::audit", "{}", message),
            AuditLevel::Error => error!(target: "rsvshop_recovery::audit", "{}", message),
        }

        let mut file = self.file.lock();
        if let Some(file) = file.as_mut() {
            let line = format!(
                "[{}] [{}] {}\n",
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                level.as_str(),
                message
            );
            if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.sync_data()) {
                error!(error = %e, "Failed to append to recovery log");
            }
        }
    }

    pub fn info(&self, message: &str) {
        self.append(AuditLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.append(AuditLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.append(AuditLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_audit_lines_are_appended() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("db-recovery.log");
        {
            let log = AuditLog::open(&path).unwrap();
            log.info("first");
            log.error("second");
        }
        let log = AuditLog::open(&path).unwrap();
        log.warn("third");

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("[INFO] first"));
        assert!(lines[1].ends_with("[ERROR] second"));
        assert!(lines[2].ends_with("[WARN] third"));
    }

    #[test]
    fn test_disabled_log_has_no_path() {
        let log = AuditLog::disabled();
        log.info("nothing to see");
        assert!(log.path().is_none());
    }
}
