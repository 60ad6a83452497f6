// Durable blob storage for queued payloads, the queue sequence and config.
//
// Keys are flat file names inside a single directory. Writes go through a
// temp file and an atomic rename so a crash never leaves a torn blob behind.

use crate::error::{RelayError, Result};
use fs2::FileExt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Name of the lock file guarding a store directory.
pub const LOCK_FILE: &str = ".delivert.lock";

/// Key/value blob storage shared by the queue, dispatch scan and config.
pub trait DurableStore: Send + Sync {
    /// Read a blob, `None` if absent.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write (or overwrite) a blob.
    fn write(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Delete a blob. Returns whether something was removed; a missing blob is
    /// not an error.
    fn delete(&self, name: &str) -> Result<bool>;

    fn exists(&self, name: &str) -> Result<bool>;

    /// Names starting with `prefix`. Each call takes a fresh listing.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Directory-backed store.
///
/// Holds an exclusive lock on the directory for its lifetime.
pub struct DirStore {
    root: PathBuf,
    _lock: fs::File,
}

impl DirStore {
    /// Open or create a store directory and take its lock.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| RelayError::io(root.display().to_string(), e))?;

        let lock_path = root.join(LOCK_FILE);
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| RelayError::io(lock_path.display().to_string(), e))?;
        lock.try_lock_exclusive()
            .map_err(|_| RelayError::StoreLocked {
                path: root.display().to_string(),
            })?;

        tracing::debug!(root = %root.display(), "Opened store");
        Ok(Self { root, _lock: lock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        // Keys are flat: reject anything that could escape the root
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name == LOCK_FILE
        {
            return Err(RelayError::io(
                name,
                io::Error::new(io::ErrorKind::InvalidInput, "invalid store key"),
            ));
        }
        Ok(self.root.join(name))
    }
}

impl DurableStore for DirStore {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_of(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RelayError::io(name, e)),
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(name)?;

        let mut temp =
            tempfile::NamedTempFile::new_in(&self.root).map_err(|e| RelayError::io(name, e))?;
        temp.write_all(bytes)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| RelayError::io(name, e))?;

        // Atomic rename
        temp.persist(&path)
            .map_err(|e| RelayError::io(name, e.error))?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RelayError::io(name, e)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path_of(name)?;
        Ok(path.is_file())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| RelayError::io(self.root.display().to_string(), e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RelayError::io(self.root.display().to_string(), e))?;
            // Skip non-UTF-8 names, they can't be ours
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name == LOCK_FILE || !name.starts_with(prefix) {
                continue;
            }
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(name);
            }
        }
        Ok(names)
    }
}
