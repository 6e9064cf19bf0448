//! Bar acquisition: exchange clients, window planning, paginated fetching,
//! rate limiting, retries and integrity checks.

pub mod binance;
pub mod cancel;
pub mod error;
pub mod fetcher;
pub mod integrity;
pub mod mock;
pub mod planner;
pub mod provider;
pub mod rate_limit;
pub mod retry;

pub use binance::{market_symbol, BinanceClient, BinanceMarket, HttpOptions};
pub use cancel::CancelToken;
pub use error::DataError;
pub use fetcher::{FetchFailure, FetchOutcome, PaginatedFetcher, StopReason};
pub use integrity::{verify_series, Gap, IntegrityReport};
pub use mock::{Fault, SyntheticExchange};
pub use planner::{FetchWindow, WindowPlanner};
pub use provider::{ExchangeClient, FetchProgress, NoProgress, TracingProgress};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;

use std::sync::Arc;

/// Exchange ids accepted by [`exchange_client`].
pub const SUPPORTED_EXCHANGES: [&str; 2] = ["binance", "binanceusdm"];

/// Build the client for an exchange id.
pub fn exchange_client(
    exchange: &str,
    options: &HttpOptions,
) -> Result<Arc<dyn ExchangeClient>, DataError> {
    let market = BinanceMarket::from_exchange_id(exchange)
        .ok_or_else(|| DataError::UnknownExchange(exchange.to_string()))?;
    Ok(Arc::new(BinanceClient::new(market, options)?))
}
