use crate::{bucket::Bucket, interval::Interval};
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// Identifies one kline stream: a trading pair at a fixed [`Interval`].
///
/// Symbols are normalised to upper case so `btcusdt@1m` and `BTCUSDT@1m` are the same stream.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct StreamKey {
    pub symbol: SmolStr,
    pub interval: Interval,
}

impl StreamKey {
    pub fn new<S>(symbol: S, interval: Interval) -> Self
    where
        S: AsRef<str>,
    {
        Self {
            symbol: SmolStr::new(symbol.as_ref().to_ascii_uppercase()),
            interval,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Fixed duration OHLCV aggregate for one symbol over one bucket.
///
/// `close_time` is the exclusive bucket end, `open_time + interval`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct Candle {
    pub symbol: SmolStr,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub is_closed: bool,
}

impl Candle {
    pub fn key(&self) -> StreamKey {
        StreamKey {
            symbol: self.symbol.clone(),
            interval: self.interval,
        }
    }
}

/// One cumulative-per-bucket snapshot delivered by the transport.
///
/// `volume` is the running total for the bucket so far, not a delta.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Constructor)]
pub struct KlineEvent {
    pub event_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub source_seq: u64,
}

/// The currently forming candle of a stream.
///
/// Only [`OpenCandle::freeze`] produces a closed [`Candle`] from live flow.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenCandle {
    symbol: SmolStr,
    interval: Interval,
    bucket: Bucket,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

impl OpenCandle {
    pub fn seed(key: &StreamKey, bucket: Bucket, event: &KlineEvent) -> Self {
        Self {
            symbol: key.symbol.clone(),
            interval: key.interval,
            bucket,
            open: event.open,
            high: event.high,
            low: event.low,
            close: event.close,
            volume: event.volume,
        }
    }

    pub fn open_time(&self) -> DateTime<Utc> {
        self.bucket.open_time
    }

    /// Fold a same-bucket update into the candle. `open` is kept from the first observation.
    pub fn merge(&mut self, event: &KlineEvent) {
        self.high = self.high.max(event.high);
        self.low = self.low.min(event.low);
        self.close = event.close;
        self.volume = event.volume;
    }

    pub fn snapshot(&self) -> Candle {
        self.to_candle(false)
    }

    pub fn freeze(self) -> Candle {
        self.to_candle(true)
    }

    fn to_candle(&self, is_closed: bool) -> Candle {
        Candle {
            symbol: self.symbol.clone(),
            interval: self.interval,
            open_time: self.bucket.open_time,
            close_time: self.bucket.close_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            is_closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn event(high: Decimal, low: Decimal, close: Decimal, volume: Decimal) -> KlineEvent {
        KlineEvent::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 10, 0).unwrap(),
            dec!(100),
            high,
            low,
            close,
            volume,
            1,
        )
    }

    #[test]
    fn test_stream_key_normalises_symbol() {
        let key = StreamKey::new("btcusdt", Interval::from_hours(1));
        assert_eq!(key, StreamKey::new("BTCUSDT", Interval::from_hours(1)));
        assert_eq!(key.to_string(), "BTCUSDT@1h");
    }

    #[test]
    fn test_open_candle_merge_and_freeze() {
        let key = StreamKey::new("BTCUSDT", Interval::from_hours(1));
        let bucket =
            Bucket::containing(Utc.with_ymd_and_hms(2024, 3, 1, 13, 10, 0).unwrap(), key.interval)
                .unwrap();

        let mut candle = OpenCandle::seed(&key, bucket, &event(dec!(101), dec!(99), dec!(100.5), dec!(3)));
        candle.merge(&event(dec!(103), dec!(100), dec!(102), dec!(5)));
        candle.merge(&event(dec!(102), dec!(97), dec!(98), dec!(8)));

        let snapshot = candle.snapshot();
        assert!(!snapshot.is_closed);

        let closed = candle.freeze();
        assert_eq!(closed.open, dec!(100));
        assert_eq!(closed.high, dec!(103));
        assert_eq!(closed.low, dec!(97));
        assert_eq!(closed.close, dec!(98));
        assert_eq!(closed.volume, dec!(8));
        assert_eq!(closed.close_time - closed.open_time, key.interval.duration());
        assert!(closed.is_closed);
        assert_eq!(closed.key(), key);
    }
}
