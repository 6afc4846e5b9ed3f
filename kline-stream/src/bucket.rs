use crate::{error::StreamError, interval::Interval};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

const WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Binance weeks open on Monday 00:00 UTC, four days after the Thursday epoch.
const WEEK_GRID_OFFSET_MS: i64 = 4 * 24 * 60 * 60 * 1000;

/// Canonical bucket open time containing `event_time`.
///
/// Floor division on the millisecond epoch, so pre-epoch times floor towards the past. Sub
/// millisecond precision of `event_time` is discarded. Whole-week intervals are floored on a
/// Monday grid instead.
pub fn bucket_start(
    event_time: DateTime<Utc>,
    interval: TimeDelta,
) -> Result<DateTime<Utc>, StreamError> {
    let interval_ms = interval.num_milliseconds();
    if interval_ms <= 0 {
        return Err(StreamError::NonPositiveInterval(interval_ms));
    }

    let offset = if interval_ms % WEEK_MS == 0 {
        WEEK_GRID_OFFSET_MS
    } else {
        0
    };
    let event_ms = event_time.timestamp_millis();
    let open_ms = event_ms - (event_ms - offset).rem_euclid(interval_ms);

    DateTime::from_timestamp_millis(open_ms).ok_or(StreamError::TimestampOutOfRange(open_ms))
}

/// A half-open `[open_time, close_time)` candle bucket.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct Bucket {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
}

impl Bucket {
    pub fn containing(time: DateTime<Utc>, interval: Interval) -> Result<Self, StreamError> {
        let open_time = bucket_start(time, interval.duration())?;
        Ok(Self {
            open_time,
            close_time: open_time + interval.duration(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn time(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_bucket_start() {
        struct TestCase {
            event_time: DateTime<Utc>,
            interval: TimeDelta,
            expected: Result<DateTime<Utc>, StreamError>,
        }

        let tests = vec![
            TestCase {
                // TC0: mid bucket floors to the hour
                event_time: time(13, 59, 30),
                interval: TimeDelta::hours(1),
                expected: Ok(time(13, 0, 0)),
            },
            TestCase {
                // TC1: exactly on a boundary opens that bucket
                event_time: time(14, 0, 0),
                interval: TimeDelta::hours(1),
                expected: Ok(time(14, 0, 0)),
            },
            TestCase {
                // TC2: one millisecond before the boundary
                event_time: time(14, 0, 0) - TimeDelta::milliseconds(1),
                interval: TimeDelta::minutes(15),
                expected: Ok(time(13, 45, 0)),
            },
            TestCase {
                // TC3: pre-epoch floors towards the past
                event_time: DateTime::from_timestamp_millis(-1).unwrap(),
                interval: TimeDelta::minutes(1),
                expected: Ok(DateTime::from_timestamp_millis(-60_000).unwrap()),
            },
            TestCase {
                // TC4: Wednesday floors to the Monday that opened the week
                event_time: Utc.with_ymd_and_hms(2024, 3, 6, 9, 30, 0).unwrap(),
                interval: TimeDelta::weeks(1),
                expected: Ok(Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()),
            },
            TestCase {
                // TC5: Friday of the same week, after the Thursday epoch boundary
                event_time: Utc.with_ymd_and_hms(2024, 3, 8, 23, 0, 0).unwrap(),
                interval: TimeDelta::weeks(1),
                expected: Ok(Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()),
            },
            TestCase {
                // TC6: Sunday night is still the previous week
                event_time: Utc.with_ymd_and_hms(2024, 3, 3, 23, 59, 59).unwrap(),
                interval: TimeDelta::weeks(1),
                expected: Ok(Utc.with_ymd_and_hms(2024, 2, 26, 0, 0, 0).unwrap()),
            },
            TestCase {
                // TC7: zero interval rejected
                event_time: time(14, 0, 0),
                interval: TimeDelta::zero(),
                expected: Err(StreamError::NonPositiveInterval(0)),
            },
            TestCase {
                // TC8: negative interval rejected
                event_time: time(14, 0, 0),
                interval: TimeDelta::seconds(-60),
                expected: Err(StreamError::NonPositiveInterval(-60_000)),
            },
            TestCase {
                // TC9: sub-millisecond interval rejected
                event_time: time(14, 0, 0),
                interval: TimeDelta::microseconds(10),
                expected: Err(StreamError::NonPositiveInterval(0)),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = bucket_start(test.event_time, test.interval);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_bucket_containing() {
        let bucket = Bucket::containing(time(13, 59, 30), Interval::from_hours(1)).unwrap();
        assert_eq!(bucket.open_time, time(13, 0, 0));
        assert_eq!(bucket.close_time, time(14, 0, 0));

        let week = Bucket::containing(
            Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap(),
            Interval::from_str("1w").unwrap(),
        )
        .unwrap();
        assert_eq!(week.open_time, Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap());
        assert_eq!(week.close_time, Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
    }
}
