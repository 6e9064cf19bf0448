//! User-facing time expressions → epoch milliseconds.
//!
//! Accepted forms:
//! - `now` (any case), resolved when parsed
//! - epoch milliseconds, e.g. `1672531200000`; integers too small to be
//!   milliseconds (at most 10 digits) are read as epoch seconds
//! - `YYYY-MM-DD`, midnight UTC
//! - `YYYY-MM-DD HH:MM[:SS]` or `YYYY-MM-DDTHH:MM[:SS]`, UTC
//! - RFC 3339 with an explicit offset

use crate::data::DataError;
use crate::domain::Timestamp;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

pub const NOW_TOKEN: &str = "now";

/// Eleven digits or more is already milliseconds (1970-04-26 as ms, year
/// 2286 as seconds).
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse a time expression against the current wall clock.
pub fn parse_time_expr(input: &str) -> Result<Timestamp, DataError> {
    parse_time_expr_at(input, Utc::now())
}

/// Parse a time expression, resolving `now` to the given instant.
pub fn parse_time_expr_at(input: &str, now: DateTime<Utc>) -> Result<Timestamp, DataError> {
    let invalid = || DataError::InvalidTimeExpression(input.to_string());
    let text = input.trim();
    if text.is_empty() {
        return Err(invalid());
    }

    if text.eq_ignore_ascii_case(NOW_TOKEN) {
        return Timestamp::from_datetime(now).ok_or_else(invalid);
    }

    if text.bytes().all(|b| b.is_ascii_digit()) {
        let value: i64 = text.parse().map_err(|_| invalid())?;
        let millis = if value >= MILLIS_THRESHOLD {
            value
        } else {
            value.checked_mul(1000).ok_or_else(invalid)?
        };
        return Timestamp::new(millis).ok_or_else(invalid);
    }

    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
        return Timestamp::from_datetime(midnight.and_utc()).ok_or_else(invalid);
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Timestamp::from_datetime(naive.and_utc()).ok_or_else(invalid);
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Timestamp::from_datetime(dt.with_timezone(&Utc)).ok_or_else(invalid);
    }

    Err(invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn millis_pass_through() {
        let ts = parse_time_expr_at("1672531200000", fixed_now()).unwrap();
        assert_eq!(ts.millis(), 1_672_531_200_000);
    }

    #[test]
    fn short_integers_are_seconds() {
        let ts = parse_time_expr_at("1672531200", fixed_now()).unwrap();
        assert_eq!(ts.millis(), 1_672_531_200_000);
    }

    #[test]
    fn eleven_digits_are_millis() {
        let ts = parse_time_expr_at("10000000000", fixed_now()).unwrap();
        assert_eq!(ts.millis(), 10_000_000_000);
        let ts = parse_time_expr_at("9999999999", fixed_now()).unwrap();
        assert_eq!(ts.millis(), 9_999_999_999_000);
    }

    #[test]
    fn calendar_date_is_midnight_utc() {
        let ts = parse_time_expr_at("2023-01-01", fixed_now()).unwrap();
        assert_eq!(ts.millis(), 1_672_531_200_000);
    }

    #[test]
    fn datetime_forms() {
        let expected = 1_672_533_000_000; // 2023-01-01T00:30:00Z
        for text in [
            "2023-01-01 00:30:00",
            "2023-01-01T00:30:00",
            "2023-01-01 00:30",
            "2023-01-01T00:30:00Z",
            "2023-01-01T08:30:00+08:00",
        ] {
            assert_eq!(
                parse_time_expr_at(text, fixed_now()).unwrap().millis(),
                expected,
                "{text}"
            );
        }
    }

    #[test]
    fn now_token_uses_supplied_clock() {
        let ts = parse_time_expr_at("  NOW ", fixed_now()).unwrap();
        assert_eq!(ts.millis(), fixed_now().timestamp_millis());
    }

    #[test]
    fn rejects_garbage() {
        let garbage =
            ["", "yesterday", "-1000", "2023-13-01", "12.5", "1e12", "99999999999999999999"];
        for text in garbage {
            match parse_time_expr_at(text, fixed_now()) {
                Err(DataError::InvalidTimeExpression(raw)) => assert_eq!(raw, text),
                other => panic!("expected InvalidTimeExpression for {text:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_pre_epoch_dates() {
        assert!(parse_time_expr_at("1969-12-31", fixed_now()).is_err());
    }
}
