//! Integrity checks over a stored series: ordering, duplicates, OHLC sanity
//! and coverage gaps.

use crate::domain::{Bar, Timeframe, Timestamp};
use serde::Serialize;

/// A hole between two consecutive bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Gap {
    /// Open time of the bar before the hole.
    pub after: Timestamp,
    /// Open time of the bar after the hole.
    pub before: Timestamp,
    /// Whole bar slots missing between the two.
    pub missing: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub bar_count: usize,
    /// Pairs where a bar's open time is earlier than its predecessor's.
    pub out_of_order: usize,
    /// Pairs sharing the same open time.
    pub duplicates: usize,
    /// Bars with non-finite values or high/low outside open/close.
    pub insane_bars: usize,
    pub gaps: Vec<Gap>,
}

impl IntegrityReport {
    /// Ordering and uniqueness hold.
    pub fn is_ordered(&self) -> bool {
        self.out_of_order == 0 && self.duplicates == 0
    }

    pub fn is_clean(&self) -> bool {
        self.is_ordered() && self.insane_bars == 0 && self.gaps.is_empty()
    }

    pub fn missing_bars(&self) -> i64 {
        self.gaps.iter().map(|g| g.missing).sum()
    }
}

/// Inspect `bars` in stored order.
pub fn verify_series(bars: &[Bar], timeframe: Timeframe) -> IntegrityReport {
    let d = timeframe.duration_ms();
    let mut report = IntegrityReport {
        bar_count: bars.len(),
        insane_bars: bars.iter().filter(|b| b.is_void() || !b.is_sane()).count(),
        ..IntegrityReport::default()
    };

    for pair in bars.windows(2) {
        let (prev, next) = (pair[0].open_time, pair[1].open_time);
        if next < prev {
            report.out_of_order += 1;
        } else if next == prev {
            report.duplicates += 1;
        } else {
            let step = next.millis() - prev.millis();
            if step > d {
                report.gaps.push(Gap {
                    after: prev,
                    before: next,
                    missing: step / d - if step % d == 0 { 1 } else { 0 },
                });
            }
        }
    }
    report
}
