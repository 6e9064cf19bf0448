//! Read-only inspection of an output directory: integrity verification of
//! stored series and sidecar consistency.

use barvault_core::data::{verify_series, DataError, IntegrityReport};
use barvault_core::domain::Timeframe;
use barvault_core::storage::{list_series, StorageFormat, StorageKey, StoredSeries};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Narrows which stored series are inspected. `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct SeriesFilter {
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub format: Option<StorageFormat>,
}

impl SeriesFilter {
    pub fn matches(&self, series: &StoredSeries) -> bool {
        let key = &series.key;
        self.exchange
            .as_ref()
            .is_none_or(|e| e.trim().eq_ignore_ascii_case(key.exchange()))
            && self
                .symbol
                .as_ref()
                .is_none_or(|s| s.trim().to_uppercase() == key.symbol())
            && self.timeframe.is_none_or(|tf| tf == key.timeframe())
            && self.format.is_none_or(|f| f == series.format)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyEntry {
    pub key: StorageKey,
    pub format: StorageFormat,
    pub path: PathBuf,
    /// `Err` holds the read failure for an unreadable file.
    pub report: Result<IntegrityReport, String>,
    /// Whether the sidecar's hash matches the data file; `None` without one.
    pub sidecar_matches: Option<bool>,
}

impl VerifyEntry {
    /// Unreadable, or stored out of order / with duplicates.
    pub fn has_ordering_violation(&self) -> bool {
        self.report.as_ref().map_or(true, |r| !r.is_ordered())
    }
}

/// Verify every stored series under `root` that passes `filter`.
pub fn verify_store(root: &Path, filter: &SeriesFilter) -> Result<Vec<VerifyEntry>, DataError> {
    let mut entries = Vec::new();
    for series in list_series(root)?.into_iter().filter(|s| filter.matches(s)) {
        debug!(key = %series.key, path = %series.path.display(), "verifying");
        let report = series
            .format
            .codec()
            .read(&series.path)
            .map(|bars| verify_series(&bars, series.key.timeframe()))
            .map_err(|e| e.to_string());
        let sidecar_matches = series.meta.as_ref().map(|meta| {
            fs::read(&series.path).is_ok_and(|bytes| meta.describes(&bytes))
        });
        entries.push(VerifyEntry {
            key: series.key,
            format: series.format,
            path: series.path,
            report,
            sidecar_matches,
        });
    }
    Ok(entries)
}
