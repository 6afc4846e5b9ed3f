//! Fixed candle bucket durations.
//!
//! An [`Interval`] is a validated, strictly positive number of milliseconds with a Binance style
//! text form (`1s`, `1m`, `15m`, `1h`, `4h`, `1d`, `1w`). Calendar months are not fixed width
//! and are rejected.

use crate::error::StreamError;
use chrono::TimeDelta;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;
const MILLIS_PER_WEEK: i64 = 7 * MILLIS_PER_DAY;

/// Largest unit first, used to render the shortest whole-unit form.
const UNITS: [(char, i64); 5] = [
    ('w', MILLIS_PER_WEEK),
    ('d', MILLIS_PER_DAY),
    ('h', MILLIS_PER_HOUR),
    ('m', MILLIS_PER_MINUTE),
    ('s', MILLIS_PER_SECOND),
];

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Interval(i64);

impl Interval {
    pub fn from_millis(millis: i64) -> Result<Self, StreamError> {
        if millis <= 0 {
            return Err(StreamError::NonPositiveInterval(millis));
        }
        Ok(Self(millis))
    }

    pub const fn from_minutes(minutes: u32) -> Self {
        Self(minutes as i64 * MILLIS_PER_MINUTE)
    }

    pub const fn from_hours(hours: u32) -> Self {
        Self(hours as i64 * MILLIS_PER_HOUR)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn duration(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.0)
    }

    /// `self × count`, saturating at the widest representable span.
    pub fn times(&self, count: i64) -> TimeDelta {
        TimeDelta::milliseconds(self.0.saturating_mul(count))
    }
}

impl FromStr for Interval {
    type Err = StreamError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let unsupported = || StreamError::UnsupportedInterval(input.to_string());

        let (count, unit_millis) = if let Some(count) = input.strip_suffix("ms") {
            (count, 1)
        } else {
            let split = input
                .char_indices()
                .last()
                .map(|(index, _)| index)
                .ok_or_else(unsupported)?;
            let (count, unit) = input.split_at(split);
            let unit_millis = match unit {
                "s" => MILLIS_PER_SECOND,
                "m" => MILLIS_PER_MINUTE,
                "h" => MILLIS_PER_HOUR,
                "d" => MILLIS_PER_DAY,
                "w" => MILLIS_PER_WEEK,
                _ => return Err(unsupported()),
            };
            (count, unit_millis)
        };

        let count = count.parse::<i64>().map_err(|_| unsupported())?;
        let millis = count.checked_mul(unit_millis).ok_or_else(unsupported)?;
        Self::from_millis(millis)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match UNITS
            .iter()
            .find(|(_, unit_millis)| self.0 % unit_millis == 0)
        {
            Some((unit, unit_millis)) => write!(f, "{}{}", self.0 / unit_millis, unit),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl Serialize for Interval {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let input = String::deserialize(deserializer)?;
        Interval::from_str(&input).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_from_str() {
        struct TestCase {
            input: &'static str,
            expected: Result<i64, StreamError>,
        }

        let tests = vec![
            TestCase {
                // TC0: one minute
                input: "1m",
                expected: Ok(MILLIS_PER_MINUTE),
            },
            TestCase {
                // TC1: four hours
                input: "4h",
                expected: Ok(4 * MILLIS_PER_HOUR),
            },
            TestCase {
                // TC2: one week
                input: "1w",
                expected: Ok(MILLIS_PER_WEEK),
            },
            TestCase {
                // TC3: calendar month is rejected
                input: "1M",
                expected: Err(StreamError::UnsupportedInterval("1M".to_string())),
            },
            TestCase {
                // TC4: zero is not positive
                input: "0m",
                expected: Err(StreamError::NonPositiveInterval(0)),
            },
            TestCase {
                // TC5: missing count
                input: "h",
                expected: Err(StreamError::UnsupportedInterval("h".to_string())),
            },
            TestCase {
                // TC6: empty
                input: "",
                expected: Err(StreamError::UnsupportedInterval(String::new())),
            },
            TestCase {
                // TC7: negative
                input: "-5m",
                expected: Err(StreamError::NonPositiveInterval(-5 * MILLIS_PER_MINUTE)),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = Interval::from_str(test.input).map(|interval| interval.as_millis());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_interval_display() {
        assert_eq!(Interval::from_minutes(1).to_string(), "1m");
        assert_eq!(Interval::from_minutes(60).to_string(), "1h");
        assert_eq!(Interval::from_minutes(90).to_string(), "90m");
        assert_eq!(Interval::from_hours(24).to_string(), "1d");
        assert_eq!(Interval::from_millis(1_500).unwrap().to_string(), "1500ms");
        assert_eq!("1500ms".parse::<Interval>().unwrap().as_millis(), 1_500);
    }

    #[test]
    fn test_interval_serde() {
        let interval: Interval = serde_json::from_str(r#""15m""#).unwrap();
        assert_eq!(interval, Interval::from_minutes(15));
        assert_eq!(serde_json::to_string(&interval).unwrap(), r#""15m""#);
        assert!(serde_json::from_str::<Interval>(r#""1M""#).is_err());
    }
}
