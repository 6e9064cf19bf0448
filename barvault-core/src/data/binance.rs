//! Binance kline provider (spot and USDⓈ-M futures).
//!
//! Fetches one page of klines per call from the public REST API and maps HTTP
//! failures onto transient vs. fatal `DataError`s. Retrying and spacing
//! requests is the fetcher's job, not this client's.

use super::provider::ExchangeClient;
use super::DataError;
use crate::domain::{Bar, Timeframe, Timestamp};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const SPOT_BASE_URL: &str = "https://api.binance.com";
const USDM_BASE_URL: &str = "https://fapi.binance.com";

/// Which Binance market to read klines from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinanceMarket {
    Spot,
    UsdmFutures,
}

impl BinanceMarket {
    /// Exchange identifier used on the command line and in storage paths.
    pub fn exchange_id(self) -> &'static str {
        match self {
            BinanceMarket::Spot => "binance",
            BinanceMarket::UsdmFutures => "binanceusdm",
        }
    }

    pub fn from_exchange_id(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "binance" => Some(BinanceMarket::Spot),
            "binanceusdm" => Some(BinanceMarket::UsdmFutures),
            _ => None,
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            BinanceMarket::Spot => SPOT_BASE_URL,
            BinanceMarket::UsdmFutures => USDM_BASE_URL,
        }
    }

    fn klines_path(self) -> &'static str {
        match self {
            BinanceMarket::Spot => "/api/v3/klines",
            BinanceMarket::UsdmFutures => "/fapi/v1/klines",
        }
    }

    fn max_limit(self) -> usize {
        match self {
            BinanceMarket::Spot => 1000,
            BinanceMarket::UsdmFutures => 1500,
        }
    }
}

/// HTTP settings shared by all REST clients.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub user_agent: String,
    /// Overrides the market's default REST endpoint (testnets, proxies).
    pub base_url: Option<String>,
    /// Overrides the default spacing between requests.
    pub min_request_interval: Option<Duration>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: concat!("barvault/", env!("CARGO_PKG_VERSION")).to_string(),
            base_url: None,
            min_request_interval: None,
        }
    }
}

/// Binance error body: `{"code": -1121, "msg": "Invalid symbol."}`.
#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

pub struct BinanceClient {
    client: reqwest::blocking::Client,
    market: BinanceMarket,
    base_url: String,
    min_interval: Duration,
}

impl BinanceClient {
    pub fn new(market: BinanceMarket, options: &HttpOptions) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent.clone())
            .build()
            .map_err(|e| {
                DataError::NetworkUnreachable(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            market,
            base_url: options
                .base_url
                .clone()
                .unwrap_or_else(|| market.default_base_url().to_string())
                .trim_end_matches('/')
                .to_string(),
            min_interval: options
                .min_request_interval
                .unwrap_or(Duration::from_millis(100)),
        })
    }

    fn klines_url(&self) -> String {
        format!("{}{}", self.base_url, self.market.klines_path())
    }

    /// Parse the kline array-of-arrays body into bars.
    ///
    /// Row layout: `[open_time, open, high, low, close, volume, close_time, ...]`
    /// with prices and volume as decimal strings.
    fn parse_klines(body: &Value) -> Result<Vec<Bar>, DataError> {
        let rows = body
            .as_array()
            .ok_or_else(|| DataError::ResponseFormatChanged("klines body is not an array".into()))?;

        let mut bars = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let fields = row.as_array().ok_or_else(|| {
                DataError::ResponseFormatChanged(format!("kline row {i} is not an array"))
            })?;
            if fields.len() < 6 {
                return Err(DataError::ResponseFormatChanged(format!(
                    "kline row {i} has {} fields, expected at least 6",
                    fields.len()
                )));
            }

            let open_time = fields[0]
                .as_i64()
                .and_then(Timestamp::new)
                .ok_or_else(|| {
                    DataError::ResponseFormatChanged(format!(
                        "kline row {i}: bad open time {}",
                        fields[0]
                    ))
                })?;

            bars.push(Bar {
                open_time,
                open: decimal_field(&fields[1], i, "open")?,
                high: decimal_field(&fields[2], i, "high")?,
                low: decimal_field(&fields[3], i, "low")?,
                close: decimal_field(&fields[4], i, "close")?,
                volume: decimal_field(&fields[5], i, "volume")?,
            });
        }
        Ok(bars)
    }

    /// Map a non-success response onto the error taxonomy.
    fn classify_failure(
        symbol: &str,
        timeframe: Timeframe,
        status: reqwest::StatusCode,
        retry_after: Option<u64>,
        body: &str,
    ) -> DataError {
        use reqwest::StatusCode;

        // 418 is Binance's "IP banned until retry-after" response.
        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return DataError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(60),
            };
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return DataError::AuthenticationRequired(format!("HTTP {status}: {}", body.trim()));
        }
        if status.is_server_error() {
            return DataError::ServerError {
                status: status.as_u16(),
            };
        }

        match serde_json::from_str::<ApiError>(body) {
            Ok(api) if api.code == -1121 => DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            },
            Ok(api) if api.code == -1120 => DataError::UnsupportedTimeframe {
                exchange: "binance".to_string(),
                timeframe: timeframe.to_string(),
            },
            Ok(api) => DataError::BadRequest(format!("{} (code {})", api.msg, api.code)),
            Err(_) => DataError::BadRequest(format!("HTTP {status}: {}", body.trim())),
        }
    }
}

fn decimal_field(value: &Value, row: usize, name: &str) -> Result<f64, DataError> {
    let parsed = match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("kline row {row}: bad {name} {value}"))
        })
}

/// Exchange-native pair notation → Binance market symbol:
/// `BTC/USDT` and `BTC/USDT:USDT` both become `BTCUSDT`.
pub fn market_symbol(symbol: &str) -> String {
    let pair = symbol.split(':').next().unwrap_or(symbol);
    pair.chars()
        .filter(|c| *c != '/' && *c != '-' && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

impl ExchangeClient for BinanceClient {
    fn name(&self) -> &str {
        self.market.exchange_id()
    }

    fn max_page_size(&self) -> usize {
        self.market.max_limit()
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
        let market_symbol = market_symbol(symbol);
        let limit = limit.clamp(1, self.market.max_limit());
        let query = [
            ("symbol", market_symbol.clone()),
            ("interval", timeframe.as_str().to_string()),
            ("startTime", start.millis().to_string()),
            ("limit", limit.to_string()),
        ];

        debug!(symbol = %market_symbol, %timeframe, start = %start, limit, "GET klines");
        let resp = self
            .client
            .get(self.klines_url())
            .query(&query)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    DataError::Timeout(e.to_string())
                } else {
                    DataError::NetworkUnreachable(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = resp.text().unwrap_or_default();
            let mut err = Self::classify_failure(symbol, timeframe, status, retry_after, &body);
            if let DataError::UnsupportedTimeframe { exchange, .. } = &mut err {
                *exchange = self.market.exchange_id().to_string();
            }
            return Err(err);
        }

        let body: Value = resp.json().map_err(|e| {
            if e.is_timeout() {
                DataError::Timeout(e.to_string())
            } else {
                DataError::ResponseFormatChanged(format!(
                    "failed to parse klines for {symbol}: {e}"
                ))
            }
        })?;
        Self::parse_klines(&body)
    }
}
