//! On-disk encodings for a bar series.
//!
//! Both codecs persist the same six columns, `timestamp` (integer epoch
//! milliseconds) followed by `open, high, low, close, volume` as 64-bit
//! floats. Encoding is deterministic: the same bars always produce the same
//! bytes, which is what lets the merge writer detect no-op commits.

use crate::domain::{Bar, Timestamp};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const COLUMNS: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet: {0}")]
    Parquet(String),

    #[error("csv: {0}")]
    Csv(String),

    #[error("schema: {0}")]
    Schema(String),
}

/// Which codec a series is stored with. Also decides the file extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    #[default]
    Parquet,
    Csv,
}

impl StorageFormat {
    pub const ALL: [StorageFormat; 2] = [StorageFormat::Parquet, StorageFormat::Csv];

    pub fn extension(self) -> &'static str {
        match self {
            StorageFormat::Parquet => "parquet",
            StorageFormat::Csv => "csv",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }

    pub fn codec(self) -> Arc<dyn SeriesCodec> {
        match self {
            StorageFormat::Parquet => Arc::new(ParquetCodec),
            StorageFormat::Csv => Arc::new(CsvCodec),
        }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for StorageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(&s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown format '{s}' (expected parquet or csv)"))
    }
}

/// Encodes a full series to bytes and reads one back from disk.
pub trait SeriesCodec: Send + Sync {
    fn encode(&self, bars: &[Bar]) -> Result<Vec<u8>, CodecError>;

    fn read(&self, path: &Path) -> Result<Vec<Bar>, CodecError>;
}

// ── Parquet ─────────────────────────────────────────────────────────

pub struct ParquetCodec;

impl SeriesCodec for ParquetCodec {
    fn encode(&self, bars: &[Bar]) -> Result<Vec<u8>, CodecError> {
        let mut df = bars_to_dataframe(bars)?;
        let mut buf = Vec::new();
        ParquetWriter::new(&mut buf)
            .finish(&mut df)
            .map_err(|e| CodecError::Parquet(format!("write: {e}")))?;
        Ok(buf)
    }

    fn read(&self, path: &Path) -> Result<Vec<Bar>, CodecError> {
        let file = fs::File::open(path)?;
        let df = ParquetReader::new(file)
            .finish()
            .map_err(|e| CodecError::Parquet(format!("read: {e}")))?;
        dataframe_to_bars(&df)
    }
}

fn bars_to_dataframe(bars: &[Bar]) -> Result<DataFrame, CodecError> {
    let timestamps: Vec<i64> = bars.iter().map(|b| b.open_time.millis()).collect();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    DataFrame::new(vec![
        Column::new("timestamp".into(), timestamps),
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| CodecError::Parquet(format!("dataframe creation: {e}")))
}

fn dataframe_to_bars(df: &DataFrame) -> Result<Vec<Bar>, CodecError> {
    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(CodecError::Schema(format!("missing column '{name}'")));
        }
    }

    let column = |name: &str, dtype: &DataType| -> Result<Column, CodecError> {
        df.column(name)
            .and_then(|c| c.cast(dtype))
            .map_err(|e| CodecError::Schema(format!("column '{name}': {e}")))
    };
    let ts = column("timestamp", &DataType::Int64)?;
    let open = column("open", &DataType::Float64)?;
    let high = column("high", &DataType::Float64)?;
    let low = column("low", &DataType::Float64)?;
    let close = column("close", &DataType::Float64)?;
    let volume = column("volume", &DataType::Float64)?;

    let type_err = |e: PolarsError| CodecError::Schema(format!("column type: {e}"));
    let ts = ts.i64().map_err(type_err)?;
    let open = open.f64().map_err(type_err)?;
    let high = high.f64().map_err(type_err)?;
    let low = low.f64().map_err(type_err)?;
    let close = close.f64().map_err(type_err)?;
    let volume = volume.f64().map_err(type_err)?;

    let mut bars = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let millis = ts
            .get(i)
            .ok_or_else(|| CodecError::Schema(format!("null timestamp at row {i}")))?;
        let open_time = Timestamp::new(millis)
            .ok_or_else(|| CodecError::Schema(format!("negative timestamp {millis} at row {i}")))?;
        bars.push(Bar {
            open_time,
            open: open.get(i).unwrap_or(f64::NAN),
            high: high.get(i).unwrap_or(f64::NAN),
            low: low.get(i).unwrap_or(f64::NAN),
            close: close.get(i).unwrap_or(f64::NAN),
            volume: volume.get(i).unwrap_or(f64::NAN),
        });
    }
    Ok(bars)
}

// ── CSV ─────────────────────────────────────────────────────────────

pub struct CsvCodec;

impl SeriesCodec for CsvCodec {
    fn encode(&self, bars: &[Bar]) -> Result<Vec<u8>, CodecError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .write_record(COLUMNS)
            .map_err(|e| CodecError::Csv(e.to_string()))?;
        for bar in bars {
            writer
                .serialize(bar)
                .map_err(|e| CodecError::Csv(e.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|e| CodecError::Csv(e.to_string()))
    }

    fn read(&self, path: &Path) -> Result<Vec<Bar>, CodecError> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| CodecError::Csv(e.to_string()))?;
        let headers = reader
            .headers()
            .map_err(|e| CodecError::Csv(e.to_string()))?
            .clone();
        if !headers.is_empty() {
            for name in COLUMNS {
                if !headers.iter().any(|h| h == name) {
                    return Err(CodecError::Schema(format!("missing column '{name}'")));
                }
            }
        }
        reader
            .deserialize::<Bar>()
            .enumerate()
            .map(|(row, r)| r.map_err(|e| CodecError::Csv(format!("row {}: {e}", row + 1))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Vec<Bar> {
        vec![
            Bar {
                open_time: Timestamp::new(1_700_000_000_000).unwrap(),
                open: 35_000.12,
                high: 35_100.5,
                low: 34_999.99,
                close: 35_050.0,
                volume: 12.345_678,
            },
            Bar {
                open_time: Timestamp::new(1_700_000_060_000).unwrap(),
                open: 35_050.0,
                high: 35_060.1,
                low: 35_001.0,
                close: 35_002.3,
                volume: 0.1 + 0.2,
            },
        ]
    }

    fn write_and_read(format: StorageFormat, bars: &[Bar]) -> Vec<Bar> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(format!("1m.{}", format.extension()));
        let codec = format.codec();
        fs::write(&path, codec.encode(bars).unwrap()).unwrap();
        codec.read(&path).unwrap()
    }

    #[test]
    fn parquet_preserves_values_exactly() {
        assert_eq!(write_and_read(StorageFormat::Parquet, &sample()), sample());
    }

    #[test]
    fn csv_preserves_values_exactly() {
        assert_eq!(write_and_read(StorageFormat::Csv, &sample()), sample());
    }

    #[test]
    fn encoding_is_deterministic() {
        for format in StorageFormat::ALL {
            let codec = format.codec();
            assert_eq!(codec.encode(&sample()).unwrap(), codec.encode(&sample()).unwrap());
        }
    }

    #[test]
    fn csv_layout_has_header_and_integer_timestamps() {
        let bytes = CsvCodec.encode(&sample()[..1]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("timestamp,open,high,low,close,volume"));
        assert!(lines.next().unwrap().starts_with("1700000000000,35000.12,"));
    }

    #[test]
    fn empty_series_reads_back_empty() {
        for format in StorageFormat::ALL {
            assert!(write_and_read(format, &[]).is_empty());
        }
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1m.parquet");
        fs::write(&path, b"definitely not parquet").unwrap();
        assert!(ParquetCodec.read(&path).is_err());

        let path = dir.path().join("1m.csv");
        fs::write(&path, "timestamp,open\n1,abc\n").unwrap();
        assert!(CsvCodec.read(&path).is_err());
    }

    #[test]
    fn format_parsing() {
        assert_eq!("parquet".parse::<StorageFormat>().unwrap(), StorageFormat::Parquet);
        assert_eq!("CSV".parse::<StorageFormat>().unwrap(), StorageFormat::Csv);
        assert!("feather".parse::<StorageFormat>().is_err());
        assert_eq!(StorageFormat::default(), StorageFormat::Parquet);
    }
}
