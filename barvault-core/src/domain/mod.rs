//! Domain types for BarVault

pub mod bar;
pub mod timeframe;
pub mod timestamp;

pub use bar::Bar;
pub use timeframe::{ParseTimeframeError, Timeframe};
pub use timestamp::{NegativeTimestamp, Timestamp};
