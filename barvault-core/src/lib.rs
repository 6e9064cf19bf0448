//! BarVault Core: historical candlestick acquisition and storage.
//!
//! This crate contains the acquisition-and-merge pipeline:
//! - Domain types (timestamps, timeframes, bars)
//! - Time expression parsing
//! - Window planning and paginated fetching through an exchange capability
//! - Rate limiting, retry with backoff, cooperative cancellation
//! - Merge writer with atomic replace, per-key locks and metadata sidecars
//! - Integrity verification of stored series

pub mod data;
pub mod domain;
pub mod storage;
pub mod time_expr;

pub use time_expr::{parse_time_expr, parse_time_expr_at};
