use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Name of the lock file placed in the data directory.
pub const LOCK_FILE: &str = ".recovery.lock";

/// A lock file older than this is considered abandoned by a killed process.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30 * 60);

/// "Recovery in progress" flag.
///
/// Restores and backups hold a `RecoveryLease` for their whole duration, so
/// a second restore fails immediately and a scheduled backup skips. With a
/// lock file the flag also excludes other processes working on the same data
/// directory, such as emergency restore workers.
#[derive(Debug, Clone, Default)]
pub struct RecoveryGuard {
    active: Arc<AtomicBool>,
    lock_file: Option<Arc<PathBuf>>,
}

impl RecoveryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard that additionally holds `path` while a lease is out.
    pub fn with_lock_file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            lock_file: Some(Arc::new(path.into())),
        }
    }

    pub fn lock_file(&self) -> Option<&Path> {
        self.lock_file.as_deref().map(PathBuf::as_path)
    }

    /// Take the flag, or `None` if another operation already holds it.
    pub fn try_acquire(&self) -> Option<RecoveryLease> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        let mut lease = RecoveryLease {
            active: self.active.clone(),
            lock_file: None,
        };
        if let Some(path) = &self.lock_file {
            if !create_lock_file(path) {
                // Dropping the lease clears the in-process flag again.
                return None;
            }
            lease.lock_file = Some(path.clone());
        }
        Some(lease)
    }

    /// Whether this process, or another one sharing the lock file, holds the flag.
    pub fn is_active(&self) -> bool {
        if self.active.load(Ordering::Acquire) {
            return true;
        }
        match &self.lock_file {
            Some(path) => path.exists() && !is_stale(path),
            None => false,
        }
    }

    pub(crate) fn issued(&self, lease: &RecoveryLease) -> bool {
        Arc::ptr_eq(&self.active, &lease.active)
    }
}

fn create_lock_file(path: &Path) -> bool {
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                debug!(path = %path.display(), "Recovery lock taken");
                return true;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !is_stale(path) {
                    return false;
                }
                warn!(path = %path.display(), "Removing stale recovery lock");
                let _ = fs::remove_file(path);
            }
            Err(e) => {
                // Without a writable data directory there is nothing to protect.
                warn!(path = %path.display(), error = %e, "Cannot create recovery lock");
                return true;
            }
        }
    }
    false
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

/// Released on drop.
#[derive(Debug)]
pub struct RecoveryLease {
    active: Arc<AtomicBool>,
    lock_file: Option<Arc<PathBuf>>,
}

impl Drop for RecoveryLease {
    fn drop(&mut self) {
        if let Some(path) = &self.lock_file {
            if let Err(e) = fs::remove_file(path.as_path()) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Cannot remove recovery lock");
                }
            }
        }
        self.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lease_is_exclusive_and_released_on_drop() {
        let guard = RecoveryGuard::new();
        let lease = guard.try_acquire().unwrap();
        assert!(guard.is_active());
        assert!(guard.clone().try_acquire().is_none());
        drop(lease);
        assert!(!guard.is_active());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn test_lock_file_excludes_a_second_guard() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        // Two guards on one lock file behave like two processes.
        let first = RecoveryGuard::with_lock_file(&path);
        let second = RecoveryGuard::with_lock_file(&path);

        let lease = first.try_acquire().unwrap();
        assert!(path.exists());
        assert!(second.is_active());
        assert!(second.try_acquire().is_none());
        assert!(!second.active.load(Ordering::Acquire));

        drop(lease);
        assert!(!path.exists());
        assert!(!second.is_active());
        assert!(second.try_acquire().is_some());
    }

    #[test]
    fn test_missing_directory_does_not_block() {
        let dir = tempdir().unwrap();
        let guard = RecoveryGuard::with_lock_file(dir.path().join("gone").join(LOCK_FILE));
        let lease = guard.try_acquire().unwrap();
        assert!(guard.try_acquire().is_none());
        drop(lease);
        assert!(!guard.is_active());
    }

    #[test]
    fn test_issued_matches_only_own_leases() {
        let guard = RecoveryGuard::new();
        let other = RecoveryGuard::new();
        let lease = other.try_acquire().unwrap();
        assert!(other.issued(&lease));
        assert!(!guard.issued(&lease));
    }
}
