//! JSON-document backend: one file per collection under a data directory.

use super::{Collection, DataStore, Record};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RESTORE_MARKER: &str = ".restore-pending";

pub struct FileStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl FileStore {
    /// Open the store, creating the data directory on first use.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(path = %root.display(), "Opened file store");
        Ok(Self {
            root,
            lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: Collection) -> PathBuf {
        self.root.join(format!("{}.json", collection.name()))
    }

    fn ensure_reachable(&self) -> Result<()> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(Error::Connectivity(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(Error::Connectivity(format!(
                "{}: {}",
                self.root.display(),
                e
            ))),
        }
    }

    fn load(&self, collection: Collection) -> Result<Vec<Record>> {
        self.ensure_reachable()?;
        match fs::read(self.collection_path(collection)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write via a temporary file and rename so a collection is never half written.
    fn store(&self, collection: Collection, records: &[Record]) -> Result<()> {
        self.ensure_reachable()?;
        let path = self.collection_path(collection);
        let tmp = self.root.join(format!(".{}.json.tmp", collection.name()));

        let result = (|| -> Result<()> {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer(&mut file, records)?;
            file.flush()?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl DataStore for FileStore {
    fn ping(&self) -> Result<()> {
        self.ensure_reachable()?;
        fs::read_dir(&self.root)
            .map(|_| ())
            .map_err(|e| Error::Connectivity(e.to_string()))
    }

    fn count(&self, collection: Collection) -> Result<usize> {
        let _guard = self.lock.read();
        Ok(self.load(collection)?.len())
    }

    fn read_all(&self, collection: Collection) -> Result<Vec<Record>> {
        let _guard = self.lock.read();
        self.load(collection)
    }

    fn delete_all(&self, collection: Collection) -> Result<usize> {
        let _guard = self.lock.write();
        self.ensure_reachable()?;
        // A corrupted collection file is still cleared.
        let existing = match self.load(collection) {
            Ok(records) => records.len(),
            Err(e) => {
                warn!(collection = %collection, error = %e, "Discarding unreadable collection");
                0
            }
        };
        self.store(collection, &[])?;
        Ok(existing)
    }

    fn insert_many(&self, collection: Collection, records: Vec<Record>) -> Result<usize> {
        let _guard = self.lock.write();
        let mut existing = self.load(collection)?;
        let inserted = records.len();
        existing.extend(records);
        self.store(collection, &existing)?;
        Ok(inserted)
    }

    fn set_restore_pending(&self, pending: bool) -> Result<()> {
        self.ensure_reachable()?;
        let marker = self.root.join(RESTORE_MARKER);
        if pending {
            fs::write(&marker, chrono::Utc::now().to_rfc3339())?;
        } else {
            match fs::remove_file(&marker) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn restore_pending(&self) -> Result<bool> {
        self.ensure_reachable()?;
        Ok(self.root.join(RESTORE_MARKER).exists())
    }
}
