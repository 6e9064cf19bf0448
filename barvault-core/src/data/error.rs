//! Structured error types for acquisition and storage.
//!
//! These are designed to be displayable in CLI output and to tell the caller
//! whether a failure is worth retrying.

use crate::domain::Timestamp;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("invalid time expression '{0}' (expected YYYY-MM-DD, an RFC 3339 datetime, epoch milliseconds or 'now')")]
    InvalidTimeExpression(String),

    #[error("invalid range: start {} must be before end {}", .start.iso(), .end.iso())]
    InvalidRange { start: Timestamp, end: Timestamp },

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("unknown exchange '{0}' (supported: {supported})", supported = super::SUPPORTED_EXCHANGES.join(", "))]
    UnknownExchange(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by exchange (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("exchange server error: HTTP {status}")]
    ServerError { status: u16 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("timeframe {timeframe} is not supported by {exchange}")]
    UnsupportedTimeframe { exchange: String, timeframe: String },

    #[error("request rejected by exchange: {0}")]
    BadRequest(String),

    #[error("retries exhausted after {attempts} attempts; progress stopped at {reached} ({}): {source}", .reached.iso())]
    FetchExhausted {
        reached: Timestamp,
        attempts: u32,
        #[source]
        source: Box<DataError>,
    },

    #[error("storage write failed for {}: {reason}", .path.display())]
    StorageWriteError { path: PathBuf, reason: String },

    #[error("storage read failed for {}: {reason}", .path.display())]
    StorageReadError { path: PathBuf, reason: String },
}

impl DataError {
    /// Network hiccups, throttling and server-side failures are worth another
    /// attempt; everything else is fatal for the run.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataError::NetworkUnreachable(_)
                | DataError::Timeout(_)
                | DataError::RateLimited { .. }
                | DataError::ServerError { .. }
        )
    }

    /// Input validation failures, raised before any network activity.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DataError::InvalidTimeExpression(_)
                | DataError::InvalidRange { .. }
                | DataError::InvalidKey(_)
                | DataError::UnknownExchange(_)
        )
    }

    /// The instant a failed run got to, when it is known.
    pub fn reached(&self) -> Option<Timestamp> {
        match self {
            DataError::FetchExhausted { reached, .. } => Some(*reached),
            _ => None,
        }
    }

    /// Short stable name of the error kind for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            DataError::InvalidTimeExpression(_) => "InvalidTimeExpression",
            DataError::InvalidRange { .. } => "InvalidRange",
            DataError::InvalidKey(_) => "InvalidKey",
            DataError::UnknownExchange(_) => "UnknownExchange",
            DataError::NetworkUnreachable(_) => "NetworkUnreachable",
            DataError::Timeout(_) => "Timeout",
            DataError::RateLimited { .. } => "RateLimited",
            DataError::ServerError { .. } => "ServerError",
            DataError::ResponseFormatChanged(_) => "ResponseFormatChanged",
            DataError::AuthenticationRequired(_) => "AuthenticationRequired",
            DataError::SymbolNotFound { .. } => "SymbolNotFound",
            DataError::UnsupportedTimeframe { .. } => "UnsupportedTimeframe",
            DataError::BadRequest(_) => "BadRequest",
            DataError::FetchExhausted { .. } => "FetchExhausted",
            DataError::StorageWriteError { .. } => "StorageWriteError",
            DataError::StorageReadError { .. } => "StorageReadError",
        }
    }
}
