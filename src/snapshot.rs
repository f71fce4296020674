//! Snapshot files and their metadata sidecars
//!
//! Layout of the backup directory:
//! - `<stem>.json`       full export of every collection
//! - `<stem>.meta.json`  `BackupMetadata` describing the export
//!
//! Scheduled snapshots use a stem with an embedded sortable timestamp,
//! e.g. `backup-2026-10-16T09-00-00-000Z`.

use crate::error::{Error, Result};
use crate::store::{Collection, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const DATA_SUFFIX: &str = ".json";
const META_SUFFIX: &str = ".meta.json";

/// Point-in-time export of every tracked collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub collections: BTreeMap<Collection, Vec<Record>>,
    #[serde(skip)]
    pub path: Option<PathBuf>,
    #[serde(skip)]
    pub size: u64,
}

impl Snapshot {
    pub fn new(created_at: DateTime<Utc>, collections: BTreeMap<Collection, Vec<Record>>) -> Self {
        Self {
            created_at,
            collections,
            path: None,
            size: 0,
        }
    }

    /// Parse a snapshot file without consulting its sidecar.
    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Snapshot> {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::SnapshotNotFound(path.display().to_string()))
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let mut snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        snapshot.path = Some(path.to_path_buf());
        snapshot.size = bytes.len() as u64;
        Ok(snapshot)
    }

    pub fn records(&self, collection: Collection) -> &[Record] {
        self.collections
            .get(&collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn record_counts(&self) -> BTreeMap<Collection, usize> {
        self.collections
            .iter()
            .map(|(collection, records)| (*collection, records.len()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Scheduled,
    Manual,
    Unknown,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Scheduled => "scheduled",
            BackupKind::Manual => "manual",
            BackupKind::Unknown => "unknown",
        }
    }
}

/// Sidecar describing a snapshot without loading its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub timestamp: DateTime<Utc>,
    pub filename: String,
    pub size: u64,
    pub record_counts: BTreeMap<Collection, usize>,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl BackupMetadata {
    pub fn stem(&self) -> &str {
        self.filename
            .strip_suffix(DATA_SUFFIX)
            .unwrap_or(&self.filename)
    }
}

/// The backup directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stem for a scheduled snapshot taken at `at`. Sorts chronologically.
    pub fn timestamped_name(at: DateTime<Utc>) -> String {
        format!("backup-{}", at.format("%Y-%m-%dT%H-%M-%S-%3fZ"))
    }

    /// Accepts `backup-x` or `backup-x.json`; rejects anything that could
    /// escape the backup directory.
    pub fn normalize_name(name: &str) -> Result<String> {
        let stem = name.strip_suffix(DATA_SUFFIX).unwrap_or(name);
        let invalid = stem.is_empty()
            || stem.starts_with('.')
            || stem.ends_with(".meta")
            || stem.contains(['/', '\\', '\0'])
            || stem.contains("..");
        if invalid {
            return Err(Error::InvalidName(name.to_string()));
        }
        Ok(stem.to_string())
    }

    fn data_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}{}", stem, DATA_SUFFIX))
    }

    fn meta_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}{}", stem, META_SUFFIX))
    }

    /// Persist a snapshot and its sidecar.
    ///
    /// The data file is written to a temporary file and linked into place,
    /// which fails instead of overwriting when the name is already taken. If
    /// the sidecar cannot be written the data file is removed again, so a
    /// failed call never leaves a usable-looking snapshot behind.
    pub fn write(&self, name: &str, snapshot: &Snapshot, kind: BackupKind) -> Result<BackupMetadata> {
        let stem = Self::normalize_name(name)?;
        let data_path = self.data_path(&stem);
        if data_path.exists() {
            return Err(Error::SnapshotWrite(format!("{} already exists", stem)));
        }

        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|e| Error::SnapshotWrite(e.to_string()))?;
        let checksum = format!("{:08x}", crc32fast::hash(&bytes));

        match write_atomically(&self.dir, &data_path, &bytes, Placement::CreateNew) {
            Ok(()) => {}
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::SnapshotWrite(format!("{} already exists", stem)))
            }
            Err(e) => {
                return Err(Error::SnapshotWrite(format!("{}: {}", data_path.display(), e)))
            }
        }

        let metadata = BackupMetadata {
            timestamp: snapshot.created_at,
            filename: format!("{}{}", stem, DATA_SUFFIX),
            size: bytes.len() as u64,
            record_counts: snapshot.record_counts(),
            kind,
            checksum: Some(checksum),
        };

        let sidecar = serde_json::to_vec_pretty(&metadata)
            .map_err(Error::from)
            .and_then(|json| write_atomically(&self.dir, &self.meta_path(&stem), &json, Placement::Replace));
        if let Err(e) = sidecar {
            let _ = fs::remove_file(&data_path);
            return Err(Error::SnapshotWrite(format!("metadata for {}: {}", stem, e)));
        }

        debug!(snapshot = %stem, size = metadata.size, "Snapshot written");
        Ok(metadata)
    }

    /// All snapshots, newest first. Files that disappear mid-listing are skipped.
    pub fn list(&self) -> Result<Vec<BackupMetadata>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') || file_name.ends_with(META_SUFFIX) {
                continue;
            }
            let Some(stem) = file_name.strip_suffix(DATA_SUFFIX) else {
                continue;
            };
            if let Some(metadata) = self.read_metadata(stem)? {
                backups.push(metadata);
            }
        }

        backups.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(backups)
    }

    /// Stems of sidecars whose data file is gone.
    pub fn orphan_sidecars(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut orphans = Vec::new();
        for entry in entries {
            let file_name = entry?.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') {
                continue;
            }
            if let Some(stem) = file_name.strip_suffix(META_SUFFIX) {
                if !self.data_path(stem).exists() {
                    orphans.push(stem.to_string());
                }
            }
        }
        orphans.sort();
        Ok(orphans)
    }

    /// Remove a sidecar left behind without its data file.
    pub fn remove_orphan_sidecar(&self, stem: &str) -> Result<bool> {
        let stem = Self::normalize_name(stem)?;
        if self.data_path(&stem).exists() {
            return Ok(false);
        }
        remove_if_present(&self.meta_path(&stem))
    }

    pub fn latest(&self) -> Result<Option<BackupMetadata>> {
        Ok(self.list()?.into_iter().next())
    }

    pub fn metadata(&self, name: &str) -> Result<BackupMetadata> {
        let stem = Self::normalize_name(name)?;
        self.read_metadata(&stem)?
            .ok_or_else(|| Error::SnapshotNotFound(stem))
    }

    /// Sidecar for `stem`, or metadata derived from the data file when the
    /// sidecar is missing or unreadable. `None` if the data file is gone.
    fn read_metadata(&self, stem: &str) -> Result<Option<BackupMetadata>> {
        match fs::read(self.meta_path(stem)) {
            Ok(bytes) => match serde_json::from_slice::<BackupMetadata>(&bytes) {
                Ok(metadata) => return Ok(Some(metadata)),
                Err(e) => warn!(snapshot = %stem, error = %e, "Unreadable metadata sidecar"),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        let stat = match fs::metadata(self.data_path(stem)) {
            Ok(stat) => stat,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let timestamp = stat
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(BackupMetadata {
            timestamp,
            filename: format!("{}{}", stem, DATA_SUFFIX),
            size: stat.len(),
            record_counts: BTreeMap::new(),
            kind: BackupKind::Unknown,
            checksum: None,
        }))
    }

    /// Load a snapshot, verifying it against the sidecar checksum.
    pub fn load(&self, name: &str) -> Result<Snapshot> {
        let stem = Self::normalize_name(name)?;
        let path = self.data_path(&stem);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::SnapshotNotFound(stem))
            }
            Err(e) => return Err(Error::Io(e)),
        };

        if let Some(expected) = self.read_metadata(&stem)?.and_then(|m| m.checksum) {
            let actual = format!("{:08x}", crc32fast::hash(&bytes));
            if actual != expected {
                return Err(Error::Restore(format!(
                    "checksum mismatch for {}: expected {}, found {}",
                    stem, expected, actual
                )));
            }
        }

        let mut snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Restore(format!("{}: {}", stem, e)))?;
        snapshot.path = Some(path);
        snapshot.size = bytes.len() as u64;
        Ok(snapshot)
    }

    /// Remove a snapshot and its sidecar. `Ok(false)` if it was already gone.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let stem = Self::normalize_name(name)?;
        let removed = remove_if_present(&self.data_path(&stem))?;
        remove_if_present(&self.meta_path(&stem))?;
        Ok(removed)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list()?.iter().map(|m| m.size).sum())
    }
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}

#[derive(Clone, Copy)]
enum Placement {
    /// Fail with `AlreadyExists` rather than overwrite the target.
    CreateNew,
    Replace,
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn write_atomically(dir: &Path, target: &Path, bytes: &[u8], placement: Placement) -> Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(
        ".{}.{}-{}.tmp",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        match placement {
            Placement::CreateNew => {
                fs::hard_link(&tmp, target)?;
                fs::remove_file(&tmp)?;
            }
            Placement::Replace => fs::rename(&tmp, target)?,
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
