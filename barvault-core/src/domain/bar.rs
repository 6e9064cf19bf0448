//! Bar: one OHLCV candlestick.

use super::Timestamp;
use serde::{Deserialize, Serialize};

/// OHLCV bar for one time bucket of one (exchange, symbol, timeframe) series.
///
/// Identified by `open_time` within its series. Field names on disk follow the
/// stored schema: `timestamp, open, high, low, close, volume`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(rename = "timestamp")]
    pub open_time: Timestamp,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Returns true if any price or volume field is NaN or infinite.
    pub fn is_void(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .any(|v| !v.is_finite())
    }

    /// high >= max(open, close), low <= min(open, close), volume >= 0.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bar() -> Bar {
        Bar {
            open_time: Timestamp::new(1_704_067_200_000).unwrap(),
            open: 100.0,
            high: 105.0,
            low: 98.0,
            close: 103.0,
            volume: 50_000.0,
        }
    }

    #[test]
    fn bar_is_sane() {
        assert!(sample_bar().is_sane());
    }

    #[test]
    fn bar_detects_void() {
        let mut bar = sample_bar();
        bar.open = f64::NAN;
        assert!(bar.is_void());
        assert!(!bar.is_sane());
    }

    #[test]
    fn bar_detects_insane_high_low() {
        let mut bar = sample_bar();
        bar.high = 97.0;
        assert!(!bar.is_sane());
    }

    #[test]
    fn bar_rejects_negative_volume() {
        let mut bar = sample_bar();
        bar.volume = -1.0;
        assert!(!bar.is_sane());
    }

    #[test]
    fn bar_serializes_with_timestamp_column() {
        let json = serde_json::to_value(sample_bar()).unwrap();
        assert_eq!(json["timestamp"], 1_704_067_200_000i64);
        let back: Bar = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample_bar());
    }
}
