//! Paginated fetcher: drives a window plan through an exchange client.
//!
//! Per page: wait on the shared rate limiter, call the exchange, retry
//! transient failures under the retry policy, feed the page back to the
//! planner. Bars outside the requested range are dropped, bars that break
//! the OHLCV invariants are rejected, and duplicates within the run collapse
//! to the latest copy.

use super::cancel::CancelToken;
use super::planner::WindowPlanner;
use super::provider::{ExchangeClient, FetchProgress};
use super::rate_limit::RateLimiter;
use super::retry::RetryPolicy;
use super::DataError;
use crate::domain::{Bar, Timeframe, Timestamp};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a fetch stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The last page reached the end of the requested range.
    ReachedEnd,
    /// The exchange returned an empty page: no more history.
    HistoryExhausted,
    /// Cancellation was requested between pages.
    Cancelled,
}

/// Bars collected by a completed (or cancelled) fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Ascending, unique by open time, all within the requested range.
    pub bars: Vec<Bar>,
    pub reached: Timestamp,
    pub pages: usize,
    pub retries: u32,
    /// In-range bars discarded because they failed `Bar::is_sane`.
    pub rejected: usize,
    pub stop: StopReason,
}

/// A fetch that failed part-way. `partial` holds every bar accepted before
/// the failure so the caller can still commit that progress.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FetchFailure {
    #[source]
    pub error: DataError,
    pub partial: Vec<Bar>,
    pub reached: Timestamp,
}

pub struct PaginatedFetcher {
    client: Arc<dyn ExchangeClient>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    cancel: CancelToken,
}

impl PaginatedFetcher {
    /// Fetcher with its own limiter sized from the client's declared interval.
    pub fn new(client: Arc<dyn ExchangeClient>) -> Self {
        let limiter = Arc::new(RateLimiter::new(client.min_request_interval()));
        Self::with_limiter(client, limiter)
    }

    /// Fetcher that shares a limiter with other tasks on the same exchange.
    pub fn with_limiter(client: Arc<dyn ExchangeClient>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            limiter,
            retry: RetryPolicy::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Page size to plan with: the caller's hint, clamped to what the
    /// exchange allows.
    pub fn effective_page_size(&self, hint: Option<usize>) -> usize {
        let max = self.client.max_page_size().max(1);
        hint.map(|h| h.clamp(1, max)).unwrap_or(max)
    }

    /// Run the plan to completion, cancellation, or failure.
    pub fn fetch(
        &self,
        symbol: &str,
        planner: &mut WindowPlanner,
        progress: &dyn FetchProgress,
    ) -> Result<FetchOutcome, FetchFailure> {
        let timeframe = planner.timeframe();
        let (range_start, range_end) = (planner.start(), planner.end());
        let label = format!("{}:{symbol}:{timeframe}", self.client.name());
        let mut collected: BTreeMap<Timestamp, Bar> = BTreeMap::new();
        let mut pages = 0usize;
        let mut retries = 0u32;
        let mut rejected = 0usize;
        let mut cancelled = false;

        while let Some(window) = planner.next_window() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let limit = window
                .expected_bars(timeframe)
                .clamp(1, planner.page_size());
            debug!(
                key = %label,
                start = %window.start.iso(),
                end = %window.end.iso(),
                limit,
                "requesting page"
            );

            let fetched =
                self.fetch_page_with_retry(symbol, timeframe, window.start, limit, &mut retries);
            let page = match fetched {
                Ok(Some(page)) => page,
                Ok(None) => {
                    cancelled = true;
                    break;
                }
                Err(error) => {
                    warn!(
                        key = %label,
                        reached = %planner.reached().iso(),
                        error = %error,
                        "fetch aborted"
                    );
                    return Err(FetchFailure {
                        error,
                        partial: collected.into_values().collect(),
                        reached: planner.reached(),
                    });
                }
            };

            planner.advance(&page);
            pages += 1;
            let page_len = page.len();
            for bar in page {
                if bar.open_time < range_start || bar.open_time >= range_end {
                    continue;
                }
                if !bar.is_sane() {
                    rejected += 1;
                    warn!(
                        key = %label,
                        open_time = %bar.open_time.iso(),
                        ?bar,
                        "rejecting malformed bar"
                    );
                    continue;
                }
                collected.insert(bar.open_time, bar);
            }
            progress.on_page(&label, pages, page_len, planner.reached());
        }

        let stop = if cancelled {
            StopReason::Cancelled
        } else if planner.history_exhausted() {
            StopReason::HistoryExhausted
        } else {
            StopReason::ReachedEnd
        };
        let bars: Vec<Bar> = collected.into_values().collect();
        info!(
            key = %label,
            bars = bars.len(),
            pages,
            retries,
            rejected,
            stop = ?stop,
            reached = %planner.reached().iso(),
            "fetch finished"
        );
        Ok(FetchOutcome {
            bars,
            reached: planner.reached(),
            pages,
            retries,
            rejected,
            stop,
        })
    }

    /// One page with retries. `Ok(None)` means cancellation arrived while
    /// waiting to retry.
    fn fetch_page_with_retry(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Timestamp,
        limit: usize,
        retries: &mut u32,
    ) -> Result<Option<Vec<Bar>>, DataError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.limiter.acquire();
            let error = match self.client.fetch_page(symbol, timeframe, start, limit) {
                Ok(page) => return Ok(Some(page)),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if !self.retry.allows_retry(attempts) {
                return Err(DataError::FetchExhausted {
                    reached: start,
                    attempts,
                    source: Box::new(error),
                });
            }

            let delay = self
                .retry
                .delay_for(attempts, &error, &mut rand::thread_rng());
            warn!(
                symbol,
                attempt = attempts,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );
            *retries += 1;
            if !self.cancel.sleep(delay) {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::mock::{Fault, SyntheticExchange};
    use crate::data::provider::NoProgress;
    use std::time::{Duration, Instant};

    const MIN: i64 = 60_000;
    const T0: i64 = 1_700_000_040_000; // minute-aligned

    fn ts(ms: i64) -> Timestamp {
        Timestamp::new(ms).unwrap()
    }

    fn fetcher(exchange: Arc<SyntheticExchange>) -> PaginatedFetcher {
        PaginatedFetcher::with_limiter(exchange, Arc::new(RateLimiter::unlimited()))
            .retry_policy(RetryPolicy::immediate(3))
    }

    fn plan(start: i64, end: i64, page: usize) -> WindowPlanner {
        WindowPlanner::new(Timeframe::M1, ts(start), ts(end), page).unwrap()
    }

    #[test]
    fn ten_minutes_of_one_minute_bars() {
        let exchange = Arc::new(SyntheticExchange::new("synthetic"));
        let mut planner = plan(T0, T0 + 10 * MIN, 1000);
        let out = fetcher(exchange.clone()).fetch("BTC/USDT", &mut planner, &NoProgress).unwrap();

        assert_eq!(out.bars.len(), 10);
        assert_eq!(out.stop, StopReason::ReachedEnd);
        assert_eq!(out.pages, 1);
        for pair in out.bars.windows(2) {
            assert_eq!(pair[1].open_time.millis() - pair[0].open_time.millis(), MIN);
        }
        assert_eq!(exchange.requests()[0].1, 10);
    }

    #[test]
    fn paginates_with_small_pages() {
        let exchange = Arc::new(SyntheticExchange::new("synthetic"));
        let mut planner = plan(T0, T0 + 25 * MIN, 10);
        let out = fetcher(exchange.clone()).fetch("ETH/USDT", &mut planner, &NoProgress).unwrap();

        assert_eq!(out.bars.len(), 25);
        assert_eq!(out.pages, 3);
        let starts: Vec<i64> = exchange.requests().iter().map(|r| r.0.millis()).collect();
        assert_eq!(starts, vec![T0, T0 + 10 * MIN, T0 + 20 * MIN]);
    }

    #[test]
    fn transient_error_is_retried_transparently() {
        let clean = Arc::new(SyntheticExchange::new("synthetic"));
        let mut planner = plan(T0, T0 + 30 * MIN, 10);
        let expected = fetcher(clean).fetch("BTC/USDT", &mut planner, &NoProgress).unwrap();

        let flaky = Arc::new(SyntheticExchange::new("synthetic").with_fault(1, Fault::Transient));
        let mut planner = plan(T0, T0 + 30 * MIN, 10);
        let out = fetcher(flaky).fetch("BTC/USDT", &mut planner, &NoProgress).unwrap();

        assert_eq!(out.retries, 1);
        assert_eq!(out.bars, expected.bars);
    }

    #[test]
    fn exhausted_retries_report_progress() {
        let exchange = Arc::new(
            SyntheticExchange::new("synthetic")
                .with_fault(1, Fault::Transient)
                .with_fault(2, Fault::RateLimited)
                .with_fault(3, Fault::Transient),
        );
        let mut planner = plan(T0, T0 + 30 * MIN, 10);
        let failure = fetcher(exchange).fetch("BTC/USDT", &mut planner, &NoProgress).unwrap_err();

        match &failure.error {
            DataError::FetchExhausted { reached, attempts, .. } => {
                assert_eq!(*attempts, 3);
                assert_eq!(reached.millis(), T0 + 10 * MIN);
            }
            other => panic!("expected FetchExhausted, got {other:?}"),
        }
        assert_eq!(failure.partial.len(), 10);
        assert_eq!(failure.reached.millis(), T0 + 10 * MIN);
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let exchange = Arc::new(SyntheticExchange::new("synthetic").with_fault(0, Fault::Fatal));
        let mut planner = plan(T0, T0 + 30 * MIN, 10);
        let failure = fetcher(exchange.clone())
            .fetch("NOPE/USDT", &mut planner, &NoProgress)
            .unwrap_err();

        assert!(matches!(failure.error, DataError::SymbolNotFound { .. }));
        assert_eq!(exchange.call_count(), 1);
        assert!(failure.partial.is_empty());
    }

    #[test]
    fn empty_page_ends_early_without_error() {
        let exchange =
            Arc::new(SyntheticExchange::new("synthetic").listed_until(ts(T0 + 12 * MIN)));
        let mut planner = plan(T0, T0 + 60 * MIN, 10);
        let out = fetcher(exchange).fetch("BTC/USDT", &mut planner, &NoProgress).unwrap();

        assert_eq!(out.stop, StopReason::HistoryExhausted);
        assert_eq!(out.bars.len(), 12);
        assert_eq!(out.bars.last().unwrap().open_time.millis(), T0 + 11 * MIN);
    }

    #[test]
    fn late_listing_is_followed_without_gaps() {
        let exchange = Arc::new(SyntheticExchange::new("synthetic").listed_from(ts(T0 + 15 * MIN)));
        let mut planner = plan(T0, T0 + 40 * MIN, 10);
        let out = fetcher(exchange).fetch("NEW/USDT", &mut planner, &NoProgress).unwrap();

        assert_eq!(out.bars.len(), 25);
        assert_eq!(out.bars[0].open_time.millis(), T0 + 15 * MIN);
    }

    #[test]
    fn cancellation_stops_between_pages() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let exchange = Arc::new(SyntheticExchange::new("synthetic"));
        let mut planner = plan(T0, T0 + 30 * MIN, 10);
        let out = fetcher(exchange.clone())
            .cancel_token(cancel)
            .fetch("BTC/USDT", &mut planner, &NoProgress)
            .unwrap();

        assert_eq!(out.stop, StopReason::Cancelled);
        assert!(out.bars.is_empty());
        assert_eq!(exchange.call_count(), 0);
    }

    #[test]
    fn malformed_bars_are_rejected_before_collection() {
        let exchange = Arc::new(
            SyntheticExchange::new("synthetic")
                .malformed_at(ts(T0 + 3 * MIN))
                .malformed_at(ts(T0 + 7 * MIN)),
        );
        let mut planner = plan(T0, T0 + 10 * MIN, 4);
        let out = fetcher(exchange).fetch("BTC/USDT", &mut planner, &NoProgress).unwrap();

        assert_eq!(out.rejected, 2);
        assert_eq!(out.bars.len(), 8);
        assert!(out.bars.iter().all(Bar::is_sane));
        assert!(out.bars.iter().all(|b| b.open_time != ts(T0 + 3 * MIN)));
        // The planner still advances past the rejected bars.
        assert_eq!(out.stop, StopReason::ReachedEnd);
        assert_eq!(out.reached, ts(T0 + 10 * MIN));
    }

    #[test]
    fn cancellation_after_a_page_keeps_fetched_bars() {
        let cancel = CancelToken::new();
        let exchange = Arc::new(
            SyntheticExchange::new("synthetic").cancel_on_call(1, cancel.clone()),
        );
        let mut planner = plan(T0, T0 + 30 * MIN, 10);
        let out = fetcher(exchange.clone())
            .cancel_token(cancel)
            .fetch("BTC/USDT", &mut planner, &NoProgress)
            .unwrap();

        assert_eq!(out.stop, StopReason::Cancelled);
        assert_eq!(out.pages, 2);
        assert_eq!(out.bars.len(), 20);
        assert_eq!(out.reached, ts(T0 + 20 * MIN));
        assert_eq!(exchange.call_count(), 2);
    }

    #[test]
    fn cancellation_interrupts_retry_backoff() {
        let cancel = CancelToken::new();
        let exchange = Arc::new(
            SyntheticExchange::new("synthetic")
                .with_fault(1, Fault::Transient)
                .cancel_on_call(1, cancel.clone()),
        );
        let slow_retry = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        let mut planner = plan(T0, T0 + 30 * MIN, 10);
        let started = Instant::now();
        let out = PaginatedFetcher::with_limiter(
            exchange.clone(),
            Arc::new(RateLimiter::unlimited()),
        )
        .retry_policy(slow_retry)
        .cancel_token(cancel)
        .fetch("BTC/USDT", &mut planner, &NoProgress)
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(out.stop, StopReason::Cancelled);
        assert_eq!(out.retries, 1);
        assert_eq!(out.bars.len(), 10);
        assert_eq!(exchange.call_count(), 2);
    }

    #[test]
    fn page_size_hint_is_clamped() {
        let exchange = Arc::new(SyntheticExchange::new("synthetic").page_size(500));
        let f = fetcher(exchange);
        assert_eq!(f.effective_page_size(None), 500);
        assert_eq!(f.effective_page_size(Some(2000)), 500);
        assert_eq!(f.effective_page_size(Some(0)), 1);
        assert_eq!(f.effective_page_size(Some(100)), 100);
    }
}
