//! Discovery of stored series under an output root.

use super::codec::StorageFormat;
use super::key::{decode_symbol, StorageKey};
use super::meta::SeriesMeta;
use crate::data::DataError;
use crate::domain::Timeframe;
use std::fs;
use std::path::{Path, PathBuf};

/// One series found on disk.
#[derive(Debug, Clone)]
pub struct StoredSeries {
    pub key: StorageKey,
    pub format: StorageFormat,
    pub path: PathBuf,
    pub file_bytes: u64,
    pub meta: Option<SeriesMeta>,
}

/// Every `{exchange}/{symbol}/{timeframe}.{ext}` file under `root`, sorted by
/// key then format. Entries that do not match the layout are skipped.
pub fn list_series(root: &Path) -> Result<Vec<StoredSeries>, DataError> {
    let read_err = |path: &Path, e: std::io::Error| DataError::StorageReadError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let mut found = Vec::new();
    if !root.exists() {
        return Ok(found);
    }
    for exchange_dir in fs::read_dir(root).map_err(|e| read_err(root, e))?.flatten() {
        let exchange_path = exchange_dir.path();
        if !exchange_path.is_dir() {
            continue;
        }
        let exchange = exchange_dir.file_name().to_string_lossy().into_owned();

        for symbol_dir in fs::read_dir(&exchange_path)
            .map_err(|e| read_err(&exchange_path, e))?
            .flatten()
        {
            let symbol_path = symbol_dir.path();
            if !symbol_path.is_dir() {
                continue;
            }
            let Some(symbol) = decode_symbol(&symbol_dir.file_name().to_string_lossy()) else {
                continue;
            };

            for file in fs::read_dir(&symbol_path)
                .map_err(|e| read_err(&symbol_path, e))?
                .flatten()
            {
                let path = file.path();
                let Some((timeframe, format)) = parse_file_name(&path) else {
                    continue;
                };
                let Ok(key) = StorageKey::new(&exchange, &symbol, timeframe) else {
                    continue;
                };
                // Directories that merely normalize to this key are not ours.
                if key.path_in(root, format) != path {
                    continue;
                }
                let file_bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
                found.push(StoredSeries {
                    meta: SeriesMeta::read_for(&path),
                    key,
                    format,
                    path,
                    file_bytes,
                });
            }
        }
    }
    found.sort_by(|a, b| a.key.cmp(&b.key).then(a.format.cmp(&b.format)));
    Ok(found)
}

fn parse_file_name(path: &Path) -> Option<(Timeframe, StorageFormat)> {
    let name = path.file_name()?.to_str()?;
    let (stem, ext) = name.split_once('.')?;
    Some((stem.parse().ok()?, StorageFormat::from_extension(ext)?))
}
