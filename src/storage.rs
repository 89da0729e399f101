//! Persistent storage bootstrap
//!
//! Storage must be usable before the link comes up. A store that is full or
//! was written by a newer format is erased and initialized once more; any
//! failure after that is fatal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// On-disk format written by this agent
pub const STORAGE_FORMAT_VERSION: u32 = 1;

const MARKER_FILE: &str = "FORMAT";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No free pages left in storage")]
    NoFreePages,
    #[error("Storage was written by format version {found}, expected {expected}")]
    NewVersionFound { found: u32, expected: u32 },
    #[error("Storage marker is corrupt: {0:?}")]
    Corrupt(String),
    #[error("Storage I/O error")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Errors that an erase is expected to clear
    pub fn is_recoverable_by_erase(&self) -> bool {
        matches!(
            self,
            StorageError::NoFreePages
                | StorageError::NewVersionFound { .. }
                | StorageError::Corrupt(_)
        )
    }
}

/// Non-volatile storage seam
pub trait NonVolatileStorage {
    fn init(&mut self) -> Result<(), StorageError>;
    fn erase(&mut self) -> Result<(), StorageError>;
}

/// Initialize storage, erasing and retrying once when the store needs it
pub fn init_storage<S: NonVolatileStorage + ?Sized>(storage: &mut S) -> Result<(), StorageError> {
    match storage.init() {
        Ok(()) => Ok(()),
        Err(e) if e.is_recoverable_by_erase() => {
            warn!(error = %e, "Storage unusable, erasing and retrying");
            storage.erase()?;
            storage.init()
        }
        Err(e) => Err(e),
    }
}

/// Directory-backed store with a versioned format marker
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    fn map_io(error: io::Error) -> StorageError {
        // ENOSPC
        if error.raw_os_error() == Some(28) {
            StorageError::NoFreePages
        } else {
            StorageError::Io(error)
        }
    }

    fn parse_marker(contents: &str) -> Result<u32, StorageError> {
        contents
            .trim()
            .parse()
            .map_err(|_| StorageError::Corrupt(contents.trim().to_string()))
    }
}

impl NonVolatileStorage for FileStorage {
    fn init(&mut self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).map_err(Self::map_io)?;

        match fs::read_to_string(self.marker_path()) {
            Ok(contents) => {
                let found = Self::parse_marker(&contents)?;
                if found > STORAGE_FORMAT_VERSION {
                    return Err(StorageError::NewVersionFound {
                        found,
                        expected: STORAGE_FORMAT_VERSION,
                    });
                }
                if found < STORAGE_FORMAT_VERSION {
                    fs::write(self.marker_path(), STORAGE_FORMAT_VERSION.to_string())
                        .map_err(Self::map_io)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::write(self.marker_path(), STORAGE_FORMAT_VERSION.to_string())
                    .map_err(Self::map_io)?;
            }
            Err(e) => return Err(Self::map_io(e)),
        }

        info!(dir = %self.dir.display(), version = STORAGE_FORMAT_VERSION, "Storage ready");
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        info!(dir = %self.dir.display(), "Storage erased");
        Ok(())
    }
}
