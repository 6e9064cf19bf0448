//! Per-key pipeline: plan → fetch → merge for one storage key.
//!
//! Bars fetched before a failure or a cancellation are always committed
//! before the error is surfaced, so a re-run (or `--resume`) never has to
//! download them again.

use barvault_core::data::{
    CancelToken, DataError, ExchangeClient, FetchProgress, PaginatedFetcher, RateLimiter,
    RetryPolicy, StopReason, WindowPlanner,
};
use barvault_core::domain::Timestamp;
use barvault_core::storage::{CommitReport, MergeWriter, StorageKey};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::settings::ConfigError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The fetch stopped part-way; `committed` bars were saved first.
    #[error("{source} (committed {committed} bars; re-run with --since {} or --resume to continue)", .reached.iso())]
    Interrupted {
        #[source]
        source: DataError,
        reached: Timestamp,
        committed: usize,
    },
}

impl PipelineError {
    /// The instant a failed run got to, when known.
    pub fn reached(&self) -> Option<Timestamp> {
        match self {
            PipelineError::Interrupted { reached, .. } => Some(*reached),
            PipelineError::Data(e) => e.reached(),
            PipelineError::Config(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Data(e) | PipelineError::Interrupted { source: e, .. } => e.kind(),
            PipelineError::Config(_) => "Config",
        }
    }
}

/// One key to bring up to date.
#[derive(Debug, Clone)]
pub struct KeyJob {
    pub key: StorageKey,
    pub since: Timestamp,
    pub until: Timestamp,
    /// Requested page size; clamped to the exchange maximum.
    pub page_size: Option<usize>,
    /// Start after the newest stored bar when that is later than `since`.
    pub resume: bool,
}

/// Shared by every key of a run.
pub struct PipelineContext {
    pub writer: MergeWriter,
    pub retry: RetryPolicy,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyStatus {
    /// Fetched through the end of the range.
    Complete,
    /// The exchange had no bars past `reached`.
    HistoryExhausted,
    /// Nothing to fetch: the stored series already reaches `until`.
    UpToDate,
    /// Cancelled between pages; fetched bars were committed.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyReport {
    pub key: StorageKey,
    pub start: Timestamp,
    pub until: Timestamp,
    pub status: KeyStatus,
    pub pages: usize,
    pub retries: u32,
    pub fetched: usize,
    /// Bars the exchange returned that failed the OHLCV sanity check.
    pub rejected: usize,
    pub reached: Timestamp,
    pub commit: Option<CommitReport>,
}

impl KeyReport {
    pub fn committed_count(&self) -> usize {
        self.commit.as_ref().map_or(0, |c| c.committed_count)
    }
}

/// Run one key to completion, cancellation, or failure.
pub fn run_key(
    client: Arc<dyn ExchangeClient>,
    limiter: Arc<RateLimiter>,
    ctx: &PipelineContext,
    job: &KeyJob,
    progress: &dyn FetchProgress,
) -> Result<KeyReport, PipelineError> {
    let key = &job.key;
    let timeframe = key.timeframe();
    if job.since >= job.until {
        return Err(DataError::InvalidRange {
            start: job.since,
            end: job.until,
        }
        .into());
    }

    let mut start = job.since;
    if job.resume {
        if let Some(last) = ctx.writer.last_open_time(key)? {
            let next = last.plus_millis(timeframe.duration_ms());
            if next > start {
                info!(key = %key, last = %last.iso(), "resuming after stored series");
                start = next;
            }
        }
        if start >= job.until {
            info!(key = %key, "already up to date");
            return Ok(KeyReport {
                key: key.clone(),
                start,
                until: job.until,
                status: KeyStatus::UpToDate,
                pages: 0,
                retries: 0,
                fetched: 0,
                rejected: 0,
                reached: start,
                commit: None,
            });
        }
    }

    let fetcher = PaginatedFetcher::with_limiter(client, limiter)
        .retry_policy(ctx.retry.clone())
        .cancel_token(ctx.cancel.clone());
    let page_size = fetcher.effective_page_size(job.page_size);
    let mut planner = WindowPlanner::new(timeframe, start, job.until, page_size)?;
    info!(
        exchange = key.exchange(),
        symbol = key.symbol(),
        timeframe = %timeframe,
        start = %start.iso(),
        end = %job.until.iso(),
        page_size,
        pages = planner.estimated_pages(),
        "fetch planned"
    );

    match fetcher.fetch(key.symbol(), &mut planner, progress) {
        Ok(outcome) => {
            let commit = ctx.writer.commit(key, &outcome.bars)?;
            let status = match outcome.stop {
                StopReason::ReachedEnd => KeyStatus::Complete,
                StopReason::HistoryExhausted => KeyStatus::HistoryExhausted,
                StopReason::Cancelled => KeyStatus::Cancelled,
            };
            Ok(KeyReport {
                key: key.clone(),
                start,
                until: job.until,
                status,
                pages: outcome.pages,
                retries: outcome.retries,
                fetched: outcome.bars.len(),
                rejected: outcome.rejected,
                reached: outcome.reached,
                commit: Some(commit),
            })
        }
        Err(failure) => {
            let committed = failure.partial.len();
            if committed > 0 {
                match ctx.writer.commit(key, &failure.partial) {
                    Ok(_) => {
                        warn!(key = %key, committed, "committed partial progress before failing")
                    }
                    Err(e) => {
                        error!(key = %key, error = %e, "could not commit partial progress");
                        return Err(e.into());
                    }
                }
            }
            Err(PipelineError::Interrupted {
                source: failure.error,
                reached: failure.reached,
                committed,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barvault_core::data::{Fault, NoProgress, SyntheticExchange};
    use barvault_core::domain::Timeframe;
    use barvault_core::storage::StorageFormat;
    use tempfile::TempDir;

    const MIN: i64 = 60_000;
    const T0: i64 = 1_672_531_200_000;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::new(ms).unwrap()
    }

    fn ctx(dir: &TempDir) -> PipelineContext {
        PipelineContext {
            writer: MergeWriter::new(dir.path(), StorageFormat::Parquet),
            retry: RetryPolicy::immediate(2),
            cancel: CancelToken::new(),
        }
    }

    fn job(start: i64, end: i64, resume: bool) -> KeyJob {
        KeyJob {
            key: StorageKey::new("synthetic", "ETH/USDT", Timeframe::M1).unwrap(),
            since: ts(start),
            until: ts(end),
            page_size: Some(4),
            resume,
        }
    }

    fn run(
        exchange: &Arc<SyntheticExchange>,
        ctx: &PipelineContext,
        job: &KeyJob,
    ) -> Result<KeyReport, PipelineError> {
        run_key(
            exchange.clone(),
            Arc::new(RateLimiter::unlimited()),
            ctx,
            job,
            &NoProgress,
        )
    }

    #[test]
    fn fetches_and_commits() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let exchange = Arc::new(SyntheticExchange::new("synthetic"));
        let report = run(&exchange, &ctx, &job(T0, T0 + 10 * MIN, false)).unwrap();
        assert_eq!(report.status, KeyStatus::Complete);
        assert_eq!(report.fetched, 10);
        assert_eq!(report.pages, 3);
        assert_eq!(report.committed_count(), 10);
    }

    #[test]
    fn invalid_range_makes_no_request() {
        let dir = TempDir::new().unwrap();
        let exchange = Arc::new(SyntheticExchange::new("synthetic"));
        let err = run(&exchange, &ctx(&dir), &job(T0, T0, false)).unwrap_err();
        assert_eq!(err.kind(), "InvalidRange");
        assert_eq!(exchange.call_count(), 0);
    }

    #[test]
    fn resume_skips_stored_bars() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let exchange = Arc::new(SyntheticExchange::new("synthetic"));
        run(&exchange, &ctx, &job(T0, T0 + 10 * MIN, false)).unwrap();

        let exchange = Arc::new(SyntheticExchange::new("synthetic"));
        let report = run(&exchange, &ctx, &job(T0, T0 + 12 * MIN, true)).unwrap();
        assert_eq!(report.start, ts(T0 + 10 * MIN));
        assert_eq!(report.fetched, 2);
        assert_eq!(exchange.requests()[0].0, ts(T0 + 10 * MIN));
        assert_eq!(report.committed_count(), 12);
    }

    #[test]
    fn resume_when_up_to_date_makes_no_request() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let exchange = Arc::new(SyntheticExchange::new("synthetic"));
        run(&exchange, &ctx, &job(T0, T0 + 10 * MIN, false)).unwrap();
        let calls = exchange.call_count();

        let report = run(&exchange, &ctx, &job(T0, T0 + 10 * MIN, true)).unwrap();
        assert_eq!(report.status, KeyStatus::UpToDate);
        assert_eq!(exchange.call_count(), calls);
    }

    #[test]
    fn failure_commits_partial_progress_and_reports_reached() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        // Two transient faults in a row exhaust a two-attempt policy on page 3.
        let exchange = Arc::new(
            SyntheticExchange::new("synthetic")
                .with_fault(2, Fault::Transient)
                .with_fault(3, Fault::Transient),
        );
        let err = run(&exchange, &ctx, &job(T0, T0 + 20 * MIN, false)).unwrap_err();

        assert_eq!(err.kind(), "FetchExhausted");
        assert_eq!(err.reached(), Some(ts(T0 + 8 * MIN)));
        assert!(err.to_string().contains("committed 8 bars"));
        let stored = ctx.writer.load(&job(0, 1, false).key).unwrap();
        assert_eq!(stored.len(), 8);
    }

    #[test]
    fn cancel_mid_run_commits_pages_already_fetched() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let exchange = Arc::new(
            SyntheticExchange::new("synthetic").cancel_on_call(1, ctx.cancel.clone()),
        );
        let report = run(&exchange, &ctx, &job(T0, T0 + 20 * MIN, false)).unwrap();

        assert_eq!(report.status, KeyStatus::Cancelled);
        assert_eq!(report.pages, 2);
        assert_eq!(report.reached, ts(T0 + 8 * MIN));
        assert_eq!(report.committed_count(), 8);
        let stored = ctx.writer.load(&report.key).unwrap();
        assert_eq!(stored.len(), 8);
        assert_eq!(stored.last().unwrap().open_time, ts(T0 + 7 * MIN));
    }

    #[test]
    fn malformed_bars_never_reach_the_store() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let exchange = Arc::new(SyntheticExchange::new("synthetic").malformed_at(ts(T0 + 2 * MIN)));
        let report = run(&exchange, &ctx, &job(T0, T0 + 6 * MIN, false)).unwrap();

        assert_eq!(report.status, KeyStatus::Complete);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.committed_count(), 5);
        let stored = ctx.writer.load(&report.key).unwrap();
        assert!(stored.iter().all(|b| b.is_sane()));
        assert!(stored.iter().all(|b| b.open_time != ts(T0 + 2 * MIN)));
    }

    #[test]
    fn cancelled_before_start_commits_nothing() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        ctx.cancel.cancel();
        let exchange = Arc::new(SyntheticExchange::new("synthetic"));
        let report = run(&exchange, &ctx, &job(T0, T0 + 10 * MIN, false)).unwrap();
        assert_eq!(report.status, KeyStatus::Cancelled);
        assert_eq!(exchange.call_count(), 0);
        assert_eq!(report.committed_count(), 0);
    }
}
