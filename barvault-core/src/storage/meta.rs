//! Metadata sidecar written next to every committed series.
//!
//! `{timeframe}.{ext}.meta.json` records the key, the covered range, the bar
//! count and a BLAKE3 hash of the data file's bytes.

use super::codec::StorageFormat;
use super::key::StorageKey;
use crate::domain::{Timeframe, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMeta {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub format: StorageFormat,
    pub first_open_time: Timestamp,
    pub last_open_time: Timestamp,
    pub bar_count: usize,
    pub file_bytes: u64,
    pub data_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl SeriesMeta {
    pub fn new(
        key: &StorageKey,
        format: StorageFormat,
        first_open_time: Timestamp,
        last_open_time: Timestamp,
        bar_count: usize,
        data: &[u8],
    ) -> Self {
        Self {
            exchange: key.exchange().to_string(),
            symbol: key.symbol().to_string(),
            timeframe: key.timeframe(),
            format,
            first_open_time,
            last_open_time,
            bar_count,
            file_bytes: data.len() as u64,
            data_hash: hash_bytes(data),
            updated_at: Utc::now(),
        }
    }

    /// True if this sidecar describes exactly `data`.
    pub fn describes(&self, data: &[u8]) -> bool {
        self.file_bytes == data.len() as u64 && self.data_hash == hash_bytes(data)
    }

    /// Sidecar contents for `path`, or `None` if it is missing or unreadable.
    pub fn read_for(data_path: &Path) -> Option<SeriesMeta> {
        let content = fs::read_to_string(meta_path(data_path)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

pub fn meta_path(data_path: &Path) -> PathBuf {
    sibling(data_path, ".meta.json")
}

pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// `path` with `suffix` appended to its file name.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_sits_next_to_data_file() {
        let p = Path::new("/data/binance/BTC-USDT/1m.parquet");
        assert_eq!(
            meta_path(p),
            PathBuf::from("/data/binance/BTC-USDT/1m.parquet.meta.json")
        );
    }

    #[test]
    fn describes_checks_hash_and_size() {
        let key = StorageKey::new("binance", "ETH/USDT", Timeframe::M1).unwrap();
        let t = Timestamp::new(0).unwrap();
        let meta = SeriesMeta::new(&key, StorageFormat::Csv, t, t, 1, b"abc");
        assert!(meta.describes(b"abc"));
        assert!(!meta.describes(b"abd"));
        assert_eq!(meta.data_hash, blake3::hash(b"abc").to_hex().to_string());
    }

    #[test]
    fn json_shape_is_stable() {
        let key = StorageKey::new("binance", "ETH/USDT", Timeframe::H1).unwrap();
        let t = Timestamp::new(3_600_000).unwrap();
        let meta = SeriesMeta::new(&key, StorageFormat::Parquet, t, t, 1, b"x");
        let v: serde_json::Value = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["timeframe"], "1h");
        assert_eq!(v["format"], "parquet");
        assert_eq!(v["first_open_time"], 3_600_000);
        let back: SeriesMeta = serde_json::from_value(v).unwrap();
        assert_eq!(back, meta);
    }
}
