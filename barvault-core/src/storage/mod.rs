//! Persistent series storage.
//!
//! Layout: `{root}/{exchange}/{symbol-segment}/{timeframe}.{ext}`, with a
//! `.meta.json` sidecar and a `.lock` file beside each series.

pub mod catalog;
pub mod codec;
pub mod key;
pub mod lock;
pub mod merge;
pub mod meta;

pub use catalog::{list_series, StoredSeries};
pub use codec::{CodecError, CsvCodec, ParquetCodec, SeriesCodec, StorageFormat};
pub use key::{decode_symbol, encode_symbol, StorageKey};
pub use lock::KeyLock;
pub use merge::{merge_bars, CommitReport, MergeWriter};
pub use meta::SeriesMeta;
