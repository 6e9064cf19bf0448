//! Window planning for paginated kline requests.
//!
//! The planner is adaptive: the start of each window comes from the last bar
//! the exchange actually returned, advanced by one timeframe, rather than from
//! a fixed arithmetic step. Exchanges that return short pages (missing
//! history, listing date after the requested start) are therefore followed
//! without gaps and without re-fetching bars already seen.

use super::DataError;
use crate::domain::{Bar, Timeframe, Timestamp};

/// One page request: bars with open time in `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl FetchWindow {
    /// Number of bar slots of width `timeframe` in this window (rounded up).
    pub fn expected_bars(&self, timeframe: Timeframe) -> usize {
        slots(self.end.millis() - self.start.millis(), timeframe.duration_ms())
    }
}

/// `span / width` rounded up; zero for an empty span.
fn slots(span: i64, width: i64) -> usize {
    if span <= 0 || width <= 0 {
        return 0;
    }
    let count = (span as u64).div_ceil(width as u64);
    usize::try_from(count).unwrap_or(usize::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanState {
    Active,
    ReachedEnd,
    HistoryExhausted,
}

/// Lazy, finite, restartable sequence of fetch windows over `[start, end)`.
#[derive(Debug, Clone)]
pub struct WindowPlanner {
    timeframe: Timeframe,
    start: Timestamp,
    end: Timestamp,
    page_size: usize,
    cursor: Timestamp,
    state: PlanState,
}

impl WindowPlanner {
    /// Fails with `InvalidRange` unless `start < end`. A zero page size is
    /// treated as one.
    pub fn new(
        timeframe: Timeframe,
        start: Timestamp,
        end: Timestamp,
        page_size: usize,
    ) -> Result<Self, DataError> {
        if start >= end {
            return Err(DataError::InvalidRange { start, end });
        }
        Ok(Self {
            timeframe,
            start,
            end,
            page_size: page_size.max(1),
            cursor: start,
            state: PlanState::Active,
        })
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Everything before this instant has been covered (or the exchange has
    /// no data for it). A failed run resumes from here.
    pub fn reached(&self) -> Timestamp {
        self.cursor.min(self.end)
    }

    pub fn is_finished(&self) -> bool {
        self.state != PlanState::Active
    }

    /// True if the plan ended because the exchange returned an empty page.
    pub fn history_exhausted(&self) -> bool {
        self.state == PlanState::HistoryExhausted
    }

    /// The next window to request, or `None` when the plan is done.
    pub fn next_window(&self) -> Option<FetchWindow> {
        if self.is_finished() {
            return None;
        }
        let end = self.cursor.plus_millis(self.page_span()).min(self.end);
        Some(FetchWindow {
            start: self.cursor,
            end,
        })
    }

    /// Feed back the page returned for the current window.
    ///
    /// An empty page ends the plan. Otherwise the cursor moves to the latest
    /// returned open time plus one timeframe, and always by at least one
    /// timeframe so a misbehaving exchange cannot stall the plan.
    pub fn advance(&mut self, page: &[Bar]) {
        if self.is_finished() {
            return;
        }
        let d = self.timeframe.duration_ms();
        let Some(last) = page.iter().map(|b| b.open_time).max() else {
            self.state = PlanState::HistoryExhausted;
            return;
        };
        let next = last.plus_millis(d).max(self.cursor.plus_millis(d));
        self.cursor = next;
        if next >= self.end {
            self.state = PlanState::ReachedEnd;
        }
    }

    /// Rewind to the original start.
    pub fn restart(&mut self) {
        self.resume_from(self.start);
    }

    /// Rewind (or skip) to an arbitrary instant.
    pub fn resume_from(&mut self, at: Timestamp) {
        self.cursor = at;
        self.state = if at >= self.end {
            PlanState::ReachedEnd
        } else {
            PlanState::Active
        };
    }

    /// Number of requests needed if every page comes back full.
    pub fn estimated_pages(&self) -> usize {
        slots(self.end.millis() - self.cursor.millis(), self.page_span())
    }

    /// Milliseconds covered by one full page.
    fn page_span(&self) -> i64 {
        let page = i64::try_from(self.page_size).unwrap_or(i64::MAX);
        self.timeframe.duration_ms().saturating_mul(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::new(ms).unwrap()
    }

    fn bars_at(times: &[i64]) -> Vec<Bar> {
        times
            .iter()
            .map(|&t| Bar {
                open_time: ts(t),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0.0,
            })
            .collect()
    }

    #[test]
    fn rejects_empty_or_inverted_range() {
        assert!(matches!(
            WindowPlanner::new(Timeframe::M1, ts(10), ts(10), 100),
            Err(DataError::InvalidRange { .. })
        ));
        assert!(WindowPlanner::new(Timeframe::M1, ts(20), ts(10), 100).is_err());
    }

    #[test]
    fn first_window_is_bounded_by_page_and_end() {
        let p = WindowPlanner::new(Timeframe::M1, ts(0), ts(10 * MIN), 1000).unwrap();
        assert_eq!(
            p.next_window(),
            Some(FetchWindow { start: ts(0), end: ts(10 * MIN) })
        );
        let p = WindowPlanner::new(Timeframe::M1, ts(0), ts(10 * MIN), 4).unwrap();
        assert_eq!(p.next_window().unwrap().end, ts(4 * MIN));
        assert_eq!(p.estimated_pages(), 3);
    }

    #[test]
    fn advances_from_last_returned_bar() {
        let mut p = WindowPlanner::new(Timeframe::M1, ts(0), ts(10 * MIN), 4).unwrap();
        // Short page: only two bars came back.
        p.advance(&bars_at(&[0, MIN]));
        assert_eq!(p.next_window().unwrap().start, ts(2 * MIN));
        assert_eq!(p.reached(), ts(2 * MIN));
    }

    #[test]
    fn terminates_when_last_bar_reaches_end() {
        let mut p = WindowPlanner::new(Timeframe::M1, ts(0), ts(3 * MIN), 10).unwrap();
        p.advance(&bars_at(&[0, MIN, 2 * MIN]));
        assert!(p.is_finished());
        assert!(!p.history_exhausted());
        assert_eq!(p.next_window(), None);
        assert_eq!(p.reached(), ts(3 * MIN));
    }

    #[test]
    fn empty_page_ends_plan_as_exhausted() {
        let mut p = WindowPlanner::new(Timeframe::M1, ts(0), ts(10 * MIN), 4).unwrap();
        p.advance(&bars_at(&[0, MIN, 2 * MIN, 3 * MIN]));
        p.advance(&[]);
        assert!(p.history_exhausted());
        assert_eq!(p.next_window(), None);
        assert_eq!(p.reached(), ts(4 * MIN));
    }

    #[test]
    fn stale_page_still_moves_forward() {
        let mut p = WindowPlanner::new(Timeframe::M1, ts(5 * MIN), ts(10 * MIN), 4).unwrap();
        // Exchange ignores the start and returns older bars.
        p.advance(&bars_at(&[0, MIN]));
        assert_eq!(p.next_window().unwrap().start, ts(6 * MIN));
    }

    #[test]
    fn restart_and_resume() {
        let mut p = WindowPlanner::new(Timeframe::M1, ts(0), ts(10 * MIN), 4).unwrap();
        p.advance(&[]);
        assert!(p.is_finished());
        p.restart();
        assert_eq!(p.next_window().unwrap().start, ts(0));
        p.resume_from(ts(7 * MIN));
        assert_eq!(p.next_window().unwrap(), FetchWindow { start: ts(7 * MIN), end: ts(10 * MIN) });
        p.resume_from(ts(10 * MIN));
        assert!(p.is_finished());
    }

    #[test]
    fn estimates_do_not_overflow_near_the_end_of_time() {
        let p = WindowPlanner::new(Timeframe::M1, ts(0), ts(i64::MAX), 1000).unwrap();
        let per_page = (MIN * 1000) as u64;
        let expected = (i64::MAX as u64).div_ceil(per_page) as usize;
        assert_eq!(p.estimated_pages(), expected);

        let w = FetchWindow { start: ts(0), end: ts(i64::MAX) };
        let slots = (i64::MAX as u64).div_ceil(MIN as u64) as usize;
        assert_eq!(w.expected_bars(Timeframe::M1), slots);

        let p = WindowPlanner::new(Timeframe::W1, ts(i64::MAX - 1), ts(i64::MAX), usize::MAX)
            .unwrap();
        assert_eq!(p.estimated_pages(), 1);
        assert_eq!(p.next_window().unwrap().end, ts(i64::MAX));
    }

    #[test]
    fn expected_bars_rounds_up() {
        let w = FetchWindow { start: ts(0), end: ts(MIN * 5 + 1) };
        assert_eq!(w.expected_bars(Timeframe::M1), 6);
        let w = FetchWindow { start: ts(0), end: ts(0) };
        assert_eq!(w.expected_bars(Timeframe::M1), 0);
    }
}
