//! Concurrent fetch of many keys against one exchange.
//!
//! Keys run in parallel on a bounded rayon pool. Every key shares the same
//! rate limiter, so adding workers never raises the request rate. Keys that
//! have not started when cancellation arrives are skipped.

use barvault_core::data::{ExchangeClient, FetchProgress, RateLimiter};
use barvault_core::storage::StorageKey;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{info, warn};

use crate::pipeline::{run_key, KeyJob, KeyReport, KeyStatus, PipelineContext, PipelineError};

/// Outcome of a batch.
#[derive(Debug)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Keys never started because cancellation came first.
    pub skipped: usize,
    pub cancelled: bool,
    pub reports: Vec<KeyReport>,
    pub errors: Vec<(StorageKey, PipelineError)>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

enum KeyOutcome {
    Done(KeyReport),
    Failed(StorageKey, PipelineError),
    Skipped,
}

/// Run every job, at most `max_concurrent` at a time.
pub fn run_batch(
    client: Arc<dyn ExchangeClient>,
    ctx: &PipelineContext,
    jobs: &[KeyJob],
    max_concurrent: usize,
    progress: &dyn FetchProgress,
) -> BatchSummary {
    let total = jobs.len();
    let limiter = Arc::new(RateLimiter::new(client.min_request_interval()));

    let run_one = |(i, job): (usize, &KeyJob)| -> KeyOutcome {
        if ctx.cancel.is_cancelled() {
            return KeyOutcome::Skipped;
        }
        let label = job.key.to_string();
        progress.on_start(&label, i, total);
        let result = run_key(client.clone(), limiter.clone(), ctx, job, progress);
        let summary = result
            .as_ref()
            .map(KeyReport::committed_count)
            .map_err(|e| e.to_string());
        progress.on_complete(&label, i, total, &summary);
        match result {
            Ok(report) => KeyOutcome::Done(report),
            Err(e) => KeyOutcome::Failed(job.key.clone(), e),
        }
    };

    let workers = max_concurrent.clamp(1, total.max(1));
    let outcomes: Vec<KeyOutcome> = if workers > 1 {
        match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => pool.install(|| jobs.par_iter().enumerate().map(run_one).collect()),
            Err(e) => {
                warn!(error = %e, "could not build worker pool; fetching keys sequentially");
                jobs.iter().enumerate().map(run_one).collect()
            }
        }
    } else {
        jobs.iter().enumerate().map(run_one).collect()
    };

    let mut summary = BatchSummary {
        total,
        succeeded: 0,
        failed: 0,
        skipped: 0,
        cancelled: ctx.cancel.is_cancelled(),
        reports: Vec::new(),
        errors: Vec::new(),
    };
    for outcome in outcomes {
        match outcome {
            KeyOutcome::Done(report) => {
                if report.status == KeyStatus::Cancelled {
                    summary.cancelled = true;
                } else {
                    summary.succeeded += 1;
                }
                summary.reports.push(report);
            }
            KeyOutcome::Failed(key, e) => {
                summary.failed += 1;
                summary.errors.push((key, e));
            }
            KeyOutcome::Skipped => summary.skipped += 1,
        }
    }

    progress.on_batch_complete(summary.succeeded, summary.failed, total);
    info!(
        total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        "batch finished"
    );
    summary
}
