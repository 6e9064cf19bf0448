//! Storage key resolution: (exchange, symbol, timeframe) → path segments.
//!
//! Layout: `{root}/{exchange}/{symbol-segment}/{timeframe}.{ext}`
//!
//! Symbol segments are an injective encoding of the upper-cased symbol:
//! `/` becomes `-`, `:` becomes `_`, and every other byte outside `[A-Z0-9]`
//! (including literal `-`, `_`, `.` and `%`) is percent-escaped. Distinct
//! symbols therefore never share a directory, and `decode_symbol` recovers
//! the original notation.

use super::codec::StorageFormat;
use crate::data::DataError;
use crate::domain::Timeframe;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageKey {
    exchange: String,
    symbol: String,
    timeframe: Timeframe,
}

impl StorageKey {
    /// Normalizes and validates the key. Exchange ids are lower-cased and
    /// limited to `[a-z0-9_-]`; symbols are trimmed and upper-cased.
    pub fn new(exchange: &str, symbol: &str, timeframe: Timeframe) -> Result<Self, DataError> {
        let exchange = exchange.trim().to_ascii_lowercase();
        if exchange.is_empty() {
            return Err(DataError::InvalidKey("exchange is empty".into()));
        }
        if !exchange
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        {
            return Err(DataError::InvalidKey(format!(
                "exchange '{exchange}' may only contain [a-z0-9_-]"
            )));
        }

        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(DataError::InvalidKey("symbol is empty".into()));
        }

        Ok(Self {
            exchange,
            symbol,
            timeframe,
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Filesystem-safe directory name for the symbol.
    pub fn symbol_segment(&self) -> String {
        encode_symbol(&self.symbol)
    }

    /// `{exchange}/{symbol-segment}/{timeframe}.{ext}`
    pub fn relative_path(&self, format: StorageFormat) -> PathBuf {
        PathBuf::from(&self.exchange)
            .join(self.symbol_segment())
            .join(format!("{}.{}", self.timeframe, format.extension()))
    }

    pub fn path_in(&self, root: &Path, format: StorageFormat) -> PathBuf {
        root.join(self.relative_path(format))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.timeframe)
    }
}

/// Encode a (normalized) symbol as a single path segment.
pub fn encode_symbol(symbol: &str) -> String {
    let mut out = String::with_capacity(symbol.len());
    for ch in symbol.chars() {
        match ch {
            'A'..='Z' | '0'..='9' => out.push(ch),
            '/' => out.push('-'),
            ':' => out.push('_'),
            other => {
                let mut buf = [0u8; 4];
                for byte in other.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    out
}

/// Inverse of [`encode_symbol`]. Returns `None` for segments it could not
/// have produced.
pub fn decode_symbol(segment: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(segment.len());
    let mut iter = segment.bytes();
    while let Some(b) = iter.next() {
        match b {
            b'-' => bytes.push(b'/'),
            b'_' => bytes.push(b':'),
            b'%' => {
                let hi = iter.next()?;
                let lo = iter.next()?;
                let hex = [hi, lo];
                let text = std::str::from_utf8(&hex).ok()?;
                bytes.push(u8::from_str_radix(text, 16).ok()?);
            }
            b'A'..=b'Z' | b'0'..=b'9' => bytes.push(b),
            _ => return None,
        }
    }
    String::from_utf8(bytes).ok()
}
