//! Per-key advisory lock on a sibling `.lock` file.
//!
//! The lock is an OS file lock, so it serializes writers across threads of
//! this process (each guard opens its own handle) and across processes. The
//! lock file itself is left in place.

use super::meta::sibling;
use crate::data::DataError;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct KeyLock {
    file: File,
}

impl KeyLock {
    /// Block until the lock for `data_path` is held.
    pub fn acquire(data_path: &Path) -> Result<Self, DataError> {
        let path = lock_path(data_path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| DataError::StorageWriteError {
                path: path.clone(),
                reason: format!("open lock file: {e}"),
            })?;
        file.lock().map_err(|e| DataError::StorageWriteError {
            path: path.clone(),
            reason: format!("acquire lock: {e}"),
        })?;
        debug!(lock = %path.display(), "lock acquired");
        Ok(Self { file })
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub fn lock_path(data_path: &Path) -> PathBuf {
    sibling(data_path, ".lock")
}
