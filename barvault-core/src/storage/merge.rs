//! Merge writer: read, merge, sort, atomic replace.
//!
//! A commit for one key runs under the key's advisory lock:
//! 1. read the committed series (a corrupt file fails the commit)
//! 2. union with the fresh bars, newest wins, ascending by open time
//! 3. encode and write a hidden temp file in the destination directory
//! 4. fsync it and rename it over the destination, then fsync the directory
//! 5. write the metadata sidecar the same way
//!
//! The destination is never written in place, so readers only ever observe a
//! fully committed version. Leftover temp files from an interrupted commit
//! are never read and are removed by the next commit on the same key.

use super::codec::{SeriesCodec, StorageFormat};
use super::key::StorageKey;
use super::lock::KeyLock;
use super::meta::{meta_path, SeriesMeta};
use crate::data::DataError;
use crate::domain::{Bar, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Union of `existing` and `fresh`, one bar per open time (a bar in `fresh`
/// replaces an existing one), ascending.
pub fn merge_bars(existing: &[Bar], fresh: &[Bar]) -> Vec<Bar> {
    let mut merged: BTreeMap<Timestamp, Bar> = BTreeMap::new();
    for bar in existing.iter().chain(fresh) {
        merged.insert(bar.open_time, *bar);
    }
    merged.into_values().collect()
}

/// What a commit did.
#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub path: PathBuf,
    /// Bars in the series before the commit.
    pub previous_count: usize,
    /// Bars handed to the commit.
    pub fetched_count: usize,
    /// Bars in the series after the commit.
    pub committed_count: usize,
    /// False if the data file's bytes did not change (or nothing was written).
    pub changed: bool,
    pub first: Option<Timestamp>,
    pub last: Option<Timestamp>,
    pub data_hash: Option<String>,
}

impl CommitReport {
    /// Bars that were not in the series before.
    pub fn added(&self) -> usize {
        self.committed_count.saturating_sub(self.previous_count)
    }
}

pub struct MergeWriter {
    root: PathBuf,
    format: StorageFormat,
    codec: Arc<dyn SeriesCodec>,
}

impl MergeWriter {
    pub fn new(root: impl Into<PathBuf>, format: StorageFormat) -> Self {
        Self::with_codec(root, format, format.codec())
    }

    /// Writer with a custom codec; `format` still decides the file extension.
    pub fn with_codec(
        root: impl Into<PathBuf>,
        format: StorageFormat,
        codec: Arc<dyn SeriesCodec>,
    ) -> Self {
        Self {
            root: root.into(),
            format,
            codec,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    pub fn path_for(&self, key: &StorageKey) -> PathBuf {
        key.path_in(&self.root, self.format)
    }

    /// The committed series for `key`; empty if none exists yet.
    pub fn load(&self, key: &StorageKey) -> Result<Vec<Bar>, DataError> {
        self.read_existing(&self.path_for(key))
    }

    /// Open time of the newest committed bar. Uses the sidecar when its hash
    /// still matches the data file, otherwise decodes the file.
    pub fn last_open_time(&self, key: &StorageKey) -> Result<Option<Timestamp>, DataError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        if let Some(meta) = SeriesMeta::read_for(&path) {
            let current = fs::read(&path).is_ok_and(|bytes| meta.describes(&bytes));
            if current && meta.format == self.format {
                return Ok(Some(meta.last_open_time));
            }
            debug!(key = %key, "metadata sidecar is stale; reading series");
        }
        Ok(self.read_existing(&path)?.last().map(|b| b.open_time))
    }

    /// Merge `fresh` into the committed series for `key`.
    ///
    /// With no committed series and nothing fresh, nothing is written.
    pub fn commit(&self, key: &StorageKey, fresh: &[Bar]) -> Result<CommitReport, DataError> {
        let path = self.path_for(key);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        if fresh.is_empty() && !path.exists() {
            debug!(key = %key, "nothing to commit");
            return Ok(CommitReport {
                path,
                previous_count: 0,
                fetched_count: 0,
                committed_count: 0,
                changed: false,
                first: None,
                last: None,
                data_hash: None,
            });
        }

        fs::create_dir_all(&dir).map_err(|e| write_err(&dir, format!("create directory: {e}")))?;
        let _lock = KeyLock::acquire(&path)?;

        let existing = self.read_existing(&path)?;
        let merged = merge_bars(&existing, fresh);
        let bytes = self
            .codec
            .encode(&merged)
            .map_err(|e| write_err(&path, format!("encode: {e}")))?;

        let unchanged = path.exists() && fs::read(&path).is_ok_and(|current| current == bytes);
        if unchanged {
            debug!(key = %key, "series unchanged; keeping committed file");
        } else {
            replace_atomically(&path, &bytes)?;
        }
        remove_stale_temps(&path);

        let (first, last) = match (merged.first(), merged.last()) {
            (Some(f), Some(l)) => (f.open_time, l.open_time),
            _ => {
                return Ok(CommitReport {
                    path,
                    previous_count: existing.len(),
                    fetched_count: fresh.len(),
                    committed_count: 0,
                    changed: !unchanged,
                    first: None,
                    last: None,
                    data_hash: None,
                })
            }
        };

        let meta = SeriesMeta::new(key, self.format, first, last, merged.len(), &bytes);
        let meta_current = SeriesMeta::read_for(&path).is_some_and(|m| m.describes(&bytes));
        if !meta_current {
            if let Err(e) = write_meta(&path, &meta) {
                warn!(key = %key, error = %e, "failed to write metadata sidecar");
            }
        }

        info!(
            key = %key,
            path = %path.display(),
            previous = existing.len(),
            fetched = fresh.len(),
            committed = merged.len(),
            changed = !unchanged,
            "series committed"
        );

        Ok(CommitReport {
            path,
            previous_count: existing.len(),
            fetched_count: fresh.len(),
            committed_count: merged.len(),
            changed: !unchanged,
            first: Some(first),
            last: Some(last),
            data_hash: Some(meta.data_hash),
        })
    }

    fn read_existing(&self, path: &Path) -> Result<Vec<Bar>, DataError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        self.codec.read(path).map_err(|e| DataError::StorageReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

fn write_err(path: &Path, reason: String) -> DataError {
    DataError::StorageWriteError {
        path: path.to_path_buf(),
        reason,
    }
}

fn temp_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(".{name}.tmp-")
}

fn temp_path(path: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!("{}{}-{n}", temp_prefix(path), std::process::id()))
}

/// Write `bytes` to a temp file beside `path`, fsync, rename over `path`.
/// On failure the temp file is removed and `path` is untouched.
pub(crate) fn replace_atomically(path: &Path, bytes: &[u8]) -> Result<(), DataError> {
    let tmp = temp_path(path);
    let result = write_synced(&tmp, bytes)
        .map_err(|e| write_err(path, format!("write temp file {}: {e}", tmp.display())))
        .and_then(|()| {
            fs::rename(&tmp, path).map_err(|e| write_err(path, format!("atomic rename: {e}")))
        });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }
    sync_parent(path);
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            warn!(dir = %dir.display(), error = %e, "directory fsync failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

fn write_meta(path: &Path, meta: &SeriesMeta) -> Result<(), DataError> {
    let target = meta_path(path);
    let json = serde_json::to_vec_pretty(meta)
        .map_err(|e| write_err(&target, format!("meta serialization: {e}")))?;
    replace_atomically(&target, &json)
}

/// Remove temp files left by interrupted commits. Caller holds the key lock.
fn remove_stale_temps(path: &Path) {
    let Some(dir) = path.parent() else { return };
    let Ok(entries) = fs::read_dir(dir) else { return };
    let data_prefix = temp_prefix(path);
    let meta_prefix = temp_prefix(&meta_path(path));
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&data_prefix) || name.starts_with(&meta_prefix) {
            debug!(file = %name, "removing stale temp file");
            let _ = fs::remove_file(entry.path());
        }
    }
}
