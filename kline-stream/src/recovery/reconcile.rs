use crate::{
    bucket::bucket_start,
    candle::{Candle, StreamKey},
    error::StreamError,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;

/// Check that backfilled candles continue a stream exactly one interval after `anchor` and
/// reach the last bucket closed as of `now`.
///
/// Candles whose bucket has not closed yet are dropped, the live feed owns the open candle.
/// Without an anchor the first-candle alignment is not checked and an empty response is
/// accepted. Returns the closed candles, marked closed, in `open_time` order.
pub fn validate_backfill(
    key: &StreamKey,
    anchor: Option<DateTime<Utc>>,
    candles: Vec<Candle>,
    now: DateTime<Utc>,
) -> Result<Vec<Candle>, StreamError> {
    let interval = key.interval.duration();
    let mismatch = |reason: String| StreamError::BackfillMismatch {
        key: key.clone(),
        reason,
    };

    let closed = candles
        .into_iter()
        .filter(|candle| candle.open_time + interval <= now)
        .map(|mut candle| {
            candle.is_closed = true;
            candle
        })
        .collect::<Vec<_>>();

    for candle in &closed {
        if candle.symbol != key.symbol || candle.interval != key.interval {
            return Err(mismatch(format!(
                "candle {} belongs to {}",
                candle.open_time,
                candle.key()
            )));
        }
        if bucket_start(candle.open_time, interval)? != candle.open_time
            || candle.close_time != candle.open_time + interval
        {
            return Err(mismatch(format!(
                "candle {} is not aligned to {}",
                candle.open_time, key.interval
            )));
        }
    }

    if let (Some(anchor), Some(first)) = (anchor, closed.first()) {
        let expected = anchor + interval;
        if first.open_time > expected {
            return Err(StreamError::BackfillGap {
                key: key.clone(),
                expected,
                found: Some(first.open_time),
            });
        }
        if first.open_time < expected {
            return Err(mismatch(format!(
                "first candle {} overlaps anchor {}",
                first.open_time, anchor
            )));
        }
    }

    for (previous, next) in closed.iter().tuple_windows() {
        let expected = previous.open_time + interval;
        if next.open_time > expected {
            return Err(StreamError::BackfillGap {
                key: key.clone(),
                expected,
                found: Some(next.open_time),
            });
        }
        if next.open_time < expected {
            return Err(mismatch(format!(
                "candle {} follows {} by less than one interval",
                next.open_time, previous.open_time
            )));
        }
    }

    let last_closed = bucket_start(now, interval)? - interval;
    let expected_next = match (closed.last(), anchor) {
        (Some(last), _) => Some(last.open_time + interval),
        (None, Some(anchor)) => Some(anchor + interval),
        (None, None) => None,
    };
    if let Some(expected) = expected_next.filter(|expected| *expected <= last_closed) {
        return Err(StreamError::BackfillGap {
            key: key.clone(),
            expected,
            found: None,
        });
    }

    Ok(closed)
}
