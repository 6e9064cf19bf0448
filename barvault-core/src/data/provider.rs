//! Exchange capability trait and progress reporting.
//!
//! The ExchangeClient trait abstracts over kline sources (Binance spot,
//! Binance USDⓈ-M futures, the synthetic exchange used in tests) so the
//! fetcher never knows which venue it is talking to.

use super::DataError;
use crate::domain::{Bar, Timeframe, Timestamp};
use std::time::Duration;
use tracing::{info, warn};

/// A source of historical bars, one bounded page at a time.
///
/// Implementations do not retry and do not rate-limit; the paginated fetcher
/// owns both concerns.
pub trait ExchangeClient: Send + Sync {
    /// Exchange identifier, as used in storage paths (e.g. `binance`).
    fn name(&self) -> &str;

    /// Largest number of bars one request may return.
    fn max_page_size(&self) -> usize;

    /// Minimum spacing between two requests to this exchange.
    fn min_request_interval(&self) -> Duration;

    /// Fetch up to `limit` bars whose open time is at or after `start`,
    /// ascending. An empty page means there is no more history.
    fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Timestamp,
        limit: usize,
    ) -> Result<Vec<Bar>, DataError>;
}

/// Progress callbacks for per-key and multi-key fetches.
pub trait FetchProgress: Send + Sync {
    /// Called before the first page of a key is requested.
    fn on_start(&self, label: &str, index: usize, total: usize);

    /// Called after each page has been accepted.
    fn on_page(&self, label: &str, page: usize, page_bars: usize, reached: Timestamp);

    /// Called when a key has been fetched and committed (or has failed).
    fn on_complete(&self, label: &str, index: usize, total: usize, result: &Result<usize, String>);

    /// Called when every key of a batch is done.
    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize);
}

/// Progress reporter that emits `tracing` events.
pub struct TracingProgress;

impl FetchProgress for TracingProgress {
    fn on_start(&self, label: &str, index: usize, total: usize) {
        info!(key = label, "[{}/{}] fetching", index + 1, total);
    }

    fn on_page(&self, label: &str, page: usize, page_bars: usize, reached: Timestamp) {
        info!(key = label, page, bars = page_bars, reached = %reached.iso(), "page fetched");
    }

    fn on_complete(
        &self,
        label: &str,
        _index: usize,
        _total: usize,
        result: &Result<usize, String>,
    ) {
        match result {
            Ok(bars) => info!(key = label, bars, "committed"),
            Err(e) => warn!(key = label, error = %e, "failed"),
        }
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize) {
        info!(succeeded, failed, total, "batch complete");
    }
}

/// Progress reporter that discards everything.
pub struct NoProgress;

impl FetchProgress for NoProgress {
    fn on_start(&self, _: &str, _: usize, _: usize) {}
    fn on_page(&self, _: &str, _: usize, _: usize, _: Timestamp) {}
    fn on_complete(&self, _: &str, _: usize, _: usize, _: &Result<usize, String>) {}
    fn on_batch_complete(&self, _: usize, _: usize, _: usize) {}
}
