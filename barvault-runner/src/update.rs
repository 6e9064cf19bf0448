//! Bring every stored series up to a target end.
//!
//! Scans an output root, keeps the series that pass a [`SeriesFilter`], and
//! turns each into a resuming [`KeyJob`] that starts where the stored series
//! ends. Jobs are grouped by exchange and storage format, since a batch runs
//! against one client and writes through one merge writer.

use barvault_core::data::DataError;
use barvault_core::domain::Timestamp;
use barvault_core::storage::{list_series, StorageFormat, StoredSeries};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::inspect::SeriesFilter;
use crate::pipeline::KeyJob;

/// Jobs that share an exchange client and an output format.
#[derive(Debug, Clone)]
pub struct UpdateGroup {
    pub exchange: String,
    pub format: StorageFormat,
    pub jobs: Vec<KeyJob>,
}

/// Plan an update of every stored series under `root` through `until`.
///
/// Series that cannot be read, are empty, or start at or after `until` are
/// left out. Groups and the jobs inside them are in key order.
pub fn plan_updates(
    root: &Path,
    filter: &SeriesFilter,
    until: Timestamp,
    page_size: Option<usize>,
) -> Result<Vec<UpdateGroup>, DataError> {
    let mut groups: BTreeMap<(String, StorageFormat), Vec<KeyJob>> = BTreeMap::new();

    for series in list_series(root)?.into_iter().filter(|s| filter.matches(s)) {
        let Some(first) = first_open_time(&series) else {
            continue;
        };
        if first >= until {
            debug!(key = %series.key, first = %first.iso(), "series starts after target end");
            continue;
        }
        groups
            .entry((series.key.exchange().to_string(), series.format))
            .or_default()
            .push(KeyJob {
                key: series.key,
                since: first,
                until,
                page_size,
                resume: true,
            });
    }

    let planned: Vec<UpdateGroup> = groups
        .into_iter()
        .map(|((exchange, format), jobs)| UpdateGroup {
            exchange,
            format,
            jobs,
        })
        .collect();
    info!(
        groups = planned.len(),
        series = planned.iter().map(|g| g.jobs.len()).sum::<usize>(),
        until = %until.iso(),
        "planned update"
    );
    Ok(planned)
}

/// Oldest stored bar, from the sidecar when it still describes the file.
fn first_open_time(series: &StoredSeries) -> Option<Timestamp> {
    let bytes = match std::fs::read(&series.path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(key = %series.key, error = %e, "skipping unreadable series");
            return None;
        }
    };
    if let Some(meta) = series.meta.as_ref().filter(|m| m.describes(&bytes)) {
        return Some(meta.first_open_time);
    }
    match series.format.codec().read(&series.path) {
        Ok(bars) => {
            let first = bars.iter().map(|b| b.open_time).min();
            if first.is_none() {
                warn!(key = %series.key, "skipping empty series");
            }
            first
        }
        Err(e) => {
            warn!(key = %series.key, error = %e, "skipping unreadable series");
            None
        }
    }
}
