//! Binance USD-M futures kline payloads.

use crate::{
    bucket::Bucket,
    candle::{Candle, KlineEvent, StreamKey},
    error::StreamError,
    interval::Interval,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use smol_str::SmolStr;
use std::str::FromStr;

/// `<symbol>@kline_<interval>` stream message.
///
/// ```json
/// {"e":"kline","E":1709298005123,"s":"BTCUSDT","k":{"t":1709298000000,"T":1709298059999,
///  "s":"BTCUSDT","i":"1m","o":"61000.1","c":"61010.0","h":"61020.5","l":"60990.0",
///  "v":"12.345","x":false}}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceKlineMessage {
    #[serde(rename = "e")]
    pub event_type: SmolStr,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: SmolStr,
    #[serde(rename = "k")]
    pub kline: BinanceKlinePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceKlinePayload {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "i")]
    pub interval: SmolStr,
    #[serde(rename = "o", with = "rust_decimal::serde::str")]
    pub open: Decimal,
    #[serde(rename = "h", with = "rust_decimal::serde::str")]
    pub high: Decimal,
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub low: Decimal,
    #[serde(rename = "c", with = "rust_decimal::serde::str")]
    pub close: Decimal,
    #[serde(rename = "v", with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl BinanceKlineMessage {
    /// Normalise into a [`KlineEvent`].
    ///
    /// `E` is the sequence number. The event time is `E` clamped into the kline's own `[t, T]`
    /// window, so the final `x=true` update that Binance emits just after the boundary still
    /// lands in its own bucket.
    pub fn into_event(self) -> Result<(StreamKey, KlineEvent), StreamError> {
        let interval = Interval::from_str(&self.kline.interval)?;
        let key = StreamKey::new(&self.symbol, interval);

        let clamped = self
            .event_time
            .clamp(self.kline.open_time, self.kline.close_time.max(self.kline.open_time));
        let event_time = timestamp(clamped)?;
        let source_seq = u64::try_from(self.event_time)
            .map_err(|_| StreamError::Decode(format!("negative event time {}", self.event_time)))?;

        let event = KlineEvent {
            event_time,
            open: self.kline.open,
            high: self.kline.high,
            low: self.kline.low,
            close: self.kline.close,
            volume: self.kline.volume,
            source_seq,
        };

        Ok((key, event))
    }
}

/// Decode a raw stream frame. Frames that are not kline events yield `None`.
pub fn parse_kline_message(text: &str) -> Result<Option<(StreamKey, KlineEvent)>, StreamError> {
    #[derive(Deserialize)]
    struct Envelope<'a> {
        #[serde(rename = "e", borrow)]
        event_type: Option<&'a str>,
    }

    let envelope = serde_json::from_str::<Envelope<'_>>(text)
        .map_err(|error| StreamError::Decode(error.to_string()))?;
    if envelope.event_type != Some("kline") {
        return Ok(None);
    }

    serde_json::from_str::<BinanceKlineMessage>(text)
        .map_err(|error| StreamError::Decode(error.to_string()))?
        .into_event()
        .map(Some)
}

/// `GET /fapi/v1/klines` row.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceRestKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    #[allow(dead_code)] i64,    // 6: Close time
    #[allow(dead_code)] String, // 7: Quote asset volume
    #[allow(dead_code)] i64,    // 8: Number of trades
    #[allow(dead_code)] String, // 9: Taker buy base asset volume
    #[allow(dead_code)] String, // 10: Taker buy quote asset volume
    #[allow(dead_code)] String, // 11: Ignore
);

impl BinanceRestKline {
    pub fn open_time_ms(&self) -> i64 {
        self.0
    }

    /// Convert into a [`Candle`] of `key`. `is_closed` is left to the caller, REST rows include
    /// the still forming bucket.
    pub fn into_candle(self, key: &StreamKey) -> Result<Candle, StreamError> {
        let bucket = Bucket::containing(timestamp(self.0)?, key.interval)?;

        Ok(Candle {
            symbol: key.symbol.clone(),
            interval: key.interval,
            open_time: timestamp(self.0)?,
            close_time: bucket.close_time,
            open: decimal("open", &self.1)?,
            high: decimal("high", &self.2)?,
            low: decimal("low", &self.3)?,
            close: decimal("close", &self.4)?,
            volume: decimal("volume", &self.5)?,
            is_closed: false,
        })
    }
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, StreamError> {
    DateTime::from_timestamp_millis(millis).ok_or(StreamError::TimestampOutOfRange(millis))
}

fn decimal(field: &str, value: &str) -> Result<Decimal, StreamError> {
    Decimal::from_str(value)
        .map_err(|error| StreamError::Decode(format!("{field} '{value}': {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const OPEN_MS: i64 = 1_709_298_000_000;

    fn frame(event_time: i64, is_closed: bool) -> String {
        format!(
            r#"{{"e":"kline","E":{event_time},"s":"BTCUSDT","k":{{"t":{OPEN_MS},"T":{},"s":"BTCUSDT","i":"1m","f":100,"L":200,"o":"61000.1","c":"61010.0","h":"61020.5","l":"60990.0","v":"12.345","n":100,"x":{is_closed},"q":"1.0","V":"1.0","Q":"1.0","B":"0"}}}}"#,
            OPEN_MS + 59_999
        )
    }

    #[test]
    fn test_parse_kline_message() {
        let (key, event) = parse_kline_message(&frame(OPEN_MS + 5_123, false))
            .unwrap()
            .unwrap();

        assert_eq!(key, StreamKey::new("BTCUSDT", Interval::from_minutes(1)));
        assert_eq!(event.event_time.timestamp_millis(), OPEN_MS + 5_123);
        assert_eq!(event.source_seq, (OPEN_MS + 5_123) as u64);
        assert_eq!(event.open, dec!(61000.1));
        assert_eq!(event.high, dec!(61020.5));
        assert_eq!(event.low, dec!(60990.0));
        assert_eq!(event.close, dec!(61010.0));
        assert_eq!(event.volume, dec!(12.345));
    }

    #[test]
    fn test_parse_kline_message_clamps_final_update() {
        struct TestCase {
            event_time: i64,
            expected_ms: i64,
        }

        let tests = vec![
            TestCase {
                // TC0: final update delivered after the boundary stays in its bucket
                event_time: OPEN_MS + 60_012,
                expected_ms: OPEN_MS + 59_999,
            },
            TestCase {
                // TC1: skewed event before the bucket opened
                event_time: OPEN_MS - 3,
                expected_ms: OPEN_MS,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let (_, event) = parse_kline_message(&frame(test.event_time, true))
                .unwrap()
                .unwrap();
            assert_eq!(
                event.event_time.timestamp_millis(),
                test.expected_ms,
                "TC{} failed",
                index
            );
            assert_eq!(event.source_seq, test.event_time as u64, "TC{} failed", index);
        }
    }

    #[test]
    fn test_parse_kline_message_ignores_other_frames() {
        assert_eq!(parse_kline_message(r#"{"result":null,"id":1}"#), Ok(None));
        assert_eq!(
            parse_kline_message(r#"{"e":"aggTrade","E":1,"s":"BTCUSDT"}"#),
            Ok(None)
        );
        assert!(matches!(
            parse_kline_message("not json"),
            Err(StreamError::Decode(_))
        ));
    }

    #[test]
    fn test_rest_kline_into_candle() {
        let row: BinanceRestKline = serde_json::from_str(&format!(
            r#"[{OPEN_MS},"61000.1","61020.5","60990.0","61010.0","12.345",{},"1.0",100,"1.0","1.0","0"]"#,
            OPEN_MS + 59_999
        ))
        .unwrap();
        let key = StreamKey::new("BTCUSDT", Interval::from_minutes(1));

        let candle = row.into_candle(&key).unwrap();
        assert_eq!(candle.open_time.timestamp_millis(), OPEN_MS);
        assert_eq!(candle.close_time.timestamp_millis(), OPEN_MS + 60_000);
        assert_eq!(candle.close, dec!(61010.0));
        assert_eq!(candle.key(), key);
    }

    #[test]
    fn test_rest_kline_into_candle_weekly() {
        // Monday 2024-03-04, Binance weeks close on the following Monday
        let monday_ms = 1_709_510_400_000;
        let row: BinanceRestKline = serde_json::from_str(&format!(
            r#"[{monday_ms},"1","2","0.5","1.5","10",{},"1.0",100,"1.0","1.0","0"]"#,
            monday_ms + 604_799_999
        ))
        .unwrap();
        let key = StreamKey::new("BTCUSDT", Interval::from_str("1w").unwrap());

        let candle = row.into_candle(&key).unwrap();
        assert_eq!(candle.open_time.timestamp_millis(), monday_ms);
        assert_eq!(candle.close_time.timestamp_millis(), 1_710_115_200_000);
    }
}
