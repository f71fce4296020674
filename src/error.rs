use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Data store unreachable: {0}")]
    Connectivity(String),

    #[error("Data integrity check failed: {0}")]
    Integrity(String),

    #[error("Snapshot write failed: {0}")]
    SnapshotWrite(String),

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Retention enforcement failed: {0}")]
    Retention(String),

    #[error("No snapshot available: {0}")]
    NoSnapshotAvailable(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Invalid snapshot name: {0}")]
    InvalidName(String),

    #[error("Process control error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn error_code(&self) -> i32 {
        match self {
            Error::Io(_) => -1,
            Error::Serialization(_) => -2,
            Error::Connectivity(_) => -3,
            Error::Integrity(_) => -4,
            Error::SnapshotWrite(_) => -5,
            Error::Restore(_) => -6,
            Error::Retention(_) => -7,
            Error::NoSnapshotAvailable(_) => -8,
            Error::SnapshotNotFound(_) => -9,
            Error::InvalidName(_) => -10,
            Error::Process(_) => -11,
            Error::Config(_) => -13,
        }
    }

    /// Wrap any lower-level failure that happened while loading a snapshot.
    pub(crate) fn into_restore(self) -> Error {
        match self {
            e @ (Error::Restore(_)
            | Error::NoSnapshotAvailable(_)
            | Error::SnapshotNotFound(_)
            | Error::InvalidName(_)) => e,
            other => Error::Restore(other.to_string()),
        }
    }

    pub(crate) fn into_snapshot_write(self) -> Error {
        match self {
            e @ Error::SnapshotWrite(_) => e,
            other => Error::SnapshotWrite(other.to_string()),
        }
    }
}
