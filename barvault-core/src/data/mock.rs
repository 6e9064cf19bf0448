//! Deterministic in-memory exchange for tests and benchmarks.
//!
//! Bars exist at every multiple of the timeframe between the listing bounds;
//! prices are a pure function of the open time so two fetches of the same
//! range return identical data. Faults, malformed bars and cancellation can
//! be scripted.

use super::cancel::CancelToken;
use super::provider::ExchangeClient;
use super::DataError;
use crate::domain::{Bar, Timeframe, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A failure to inject on a given call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// HTTP 503, retryable.
    Transient,
    /// HTTP 429 with a zero retry-after, retryable.
    RateLimited,
    /// Unknown symbol, fatal.
    Fatal,
}

impl Fault {
    fn to_error(self, symbol: &str) -> DataError {
        match self {
            Fault::Transient => DataError::ServerError { status: 503 },
            Fault::RateLimited => DataError::RateLimited { retry_after_secs: 0 },
            Fault::Fatal => DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            },
        }
    }
}

pub struct SyntheticExchange {
    name: String,
    page_size: usize,
    min_interval: Duration,
    listed_from: Timestamp,
    listed_until: Option<Timestamp>,
    price_bias: f64,
    malformed: BTreeSet<Timestamp>,
    cancel_on: Option<(usize, CancelToken)>,
    faults: Mutex<HashMap<usize, Fault>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<(Timestamp, usize)>>,
}

impl SyntheticExchange {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            page_size: 1000,
            min_interval: Duration::ZERO,
            listed_from: Timestamp::EPOCH,
            listed_until: None,
            price_bias: 0.0,
            malformed: BTreeSet::new(),
            cancel_on: None,
            faults: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// No bars before this instant.
    pub fn listed_from(mut self, at: Timestamp) -> Self {
        self.listed_from = at;
        self
    }

    /// No bars at or after this instant.
    pub fn listed_until(mut self, at: Timestamp) -> Self {
        self.listed_until = Some(at);
        self
    }

    /// Shift every price, to simulate the exchange revising history.
    pub fn price_bias(mut self, bias: f64) -> Self {
        self.price_bias = bias;
        self
    }

    /// Serve a bar with high below low and negative volume at `open_time`.
    pub fn malformed_at(mut self, open_time: Timestamp) -> Self {
        self.malformed.insert(open_time);
        self
    }

    /// Cancel `token` when the `call`-th request (0-based) arrives. The
    /// request itself is still answered.
    pub fn cancel_on_call(mut self, call: usize, token: CancelToken) -> Self {
        self.cancel_on = Some((call, token));
        self
    }

    /// Fail the `call`-th request (0-based) with `fault`.
    pub fn with_fault(self, call: usize, fault: Fault) -> Self {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(call, fault);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request seen so far as (start, limit).
    pub fn requests(&self) -> Vec<(Timestamp, usize)> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The bar this exchange reports for `open_time`.
    pub fn bar_at(&self, open_time: Timestamp, timeframe: Timeframe) -> Bar {
        let slot = open_time.millis() / timeframe.duration_ms();
        let base = 100.0 + (slot % 50) as f64 + self.price_bias;
        Bar {
            open_time,
            open: base,
            high: base + 1.0,
            low: base - 1.0,
            close: base + 0.5,
            volume: 10.0 + (slot % 7) as f64,
        }
    }
}

impl ExchangeClient for SyntheticExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_page_size(&self) -> usize {
        self.page_size
    }

    fn min_request_interval(&self) -> Duration {
        self.min_interval
    }

    fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Timestamp,
        limit: usize,
    ) -> Result<Vec<Bar>, DataError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((start, limit));
        if let Some((at, token)) = &self.cancel_on {
            if *at == call {
                token.cancel();
            }
        }

        let fault = self
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&call);
        if let Some(fault) = fault {
            return Err(fault.to_error(symbol));
        }

        let d = timeframe.duration_ms();
        let from = start.max(self.listed_from).millis();
        let first = (from + d - 1) / d * d;
        let limit = limit.min(self.page_size);

        let mut bars = Vec::with_capacity(limit);
        let mut t = first;
        while bars.len() < limit {
            let Some(open_time) = Timestamp::new(t) else {
                break;
            };
            if self.listed_until.is_some_and(|until| open_time >= until) {
                break;
            }
            let mut bar = self.bar_at(open_time, timeframe);
            if self.malformed.contains(&open_time) {
                bar.high = bar.low - 1.0;
                bar.volume = -3.0;
            }
            bars.push(bar);
            t += d;
        }
        Ok(bars)
    }
}
