use crate::candle::Candle;
use chrono::{DateTime, TimeDelta, Utc};
use itertools::Itertools;
use std::collections::VecDeque;

/// Bounded ring of closed candles ordered by `open_time`, oldest evicted first.
#[derive(Debug, Clone)]
pub struct ClosedRing {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl ClosedRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a candle newer than [`Self::newest`], returning the evicted candle if the ring was
    /// full.
    pub fn push(&mut self, candle: Candle) -> Option<Candle> {
        debug_assert!(
            self.newest()
                .is_none_or(|newest| newest.open_time < candle.open_time)
        );

        let evicted = if self.candles.len() >= self.capacity {
            self.candles.pop_front()
        } else {
            None
        };
        self.candles.push_back(candle);
        evicted
    }

    /// Insert a candle at its `open_time` position, evicting the oldest candle if the ring is
    /// full.
    ///
    /// Returns `false` without changing anything if the bucket is already retained, or if the
    /// ring is full and the candle is older than every retained one.
    pub fn insert(&mut self, candle: Candle) -> bool {
        let index = match self
            .candles
            .binary_search_by_key(&candle.open_time, |retained| retained.open_time)
        {
            Ok(_) => return false,
            Err(index) => index,
        };

        if self.candles.len() < self.capacity {
            self.candles.insert(index, candle);
        } else if index > 0 {
            self.candles.pop_front();
            self.candles.insert(index - 1, candle);
        } else {
            return false;
        }
        true
    }

    pub fn newest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    /// `open_time` of the last candle before the first missing bucket, or of the newest candle
    /// if the retained run has no holes.
    pub fn contiguous_end(&self, interval: TimeDelta) -> Option<DateTime<Utc>> {
        self.candles
            .iter()
            .tuple_windows()
            .find(|(previous, next)| next.open_time - previous.open_time != interval)
            .map(|(previous, _)| previous.open_time)
            .or_else(|| self.newest().map(|candle| candle.open_time))
    }

    pub fn contains(&self, open_time: DateTime<Utc>) -> bool {
        self.candles
            .binary_search_by_key(&open_time, |candle| candle.open_time)
            .is_ok()
    }

    /// Newest `limit` candles, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Candle> {
        let skip = self.candles.len().saturating_sub(limit);
        self.candles.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        candle::{KlineEvent, OpenCandle, StreamKey},
        bucket::Bucket,
        interval::Interval,
    };
    use rust_decimal_macros::dec;

    fn closed(minute: i64) -> Candle {
        let key = StreamKey::new("ETHUSDT", Interval::from_minutes(1));
        let time = DateTime::from_timestamp(minute * 60, 0).unwrap();
        let event = KlineEvent::new(time, dec!(1), dec!(2), dec!(0.5), dec!(1.5), dec!(10), 1);
        OpenCandle::seed(&key, Bucket::containing(time, key.interval).unwrap(), &event).freeze()
    }

    #[test]
    fn test_closed_ring_evicts_oldest() {
        let mut ring = ClosedRing::new(3);
        assert!(ring.push(closed(1)).is_none());
        assert!(ring.push(closed(2)).is_none());
        assert!(ring.push(closed(3)).is_none());

        let evicted = ring.push(closed(4)).unwrap();
        assert_eq!(evicted.open_time, closed(1).open_time);
        assert_eq!(ring.len(), 3);
        assert!(!ring.contains(closed(1).open_time));
        assert!(ring.contains(closed(4).open_time));
        assert_eq!(ring.newest().map(|c| c.open_time), Some(closed(4).open_time));
    }

    #[test]
    fn test_closed_ring_insert_fills_holes() {
        let mut ring = ClosedRing::new(4);
        [1, 2, 4, 5].into_iter().for_each(|minute| {
            ring.push(closed(minute));
        });
        assert_eq!(ring.contiguous_end(TimeDelta::minutes(1)), Some(closed(2).open_time));

        struct TestCase {
            input: i64,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: already retained
                input: 4,
                expected: false,
            },
            TestCase {
                // TC1: hole between 2 and 4, evicts 1
                input: 3,
                expected: true,
            },
            TestCase {
                // TC2: older than everything in a full ring
                input: 1,
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = ring.insert(closed(test.input));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }

        let open_times = ring
            .recent(10)
            .into_iter()
            .map(|candle| candle.open_time)
            .collect::<Vec<_>>();
        assert_eq!(
            open_times,
            [2, 3, 4, 5].map(|minute| closed(minute).open_time).to_vec()
        );
        assert_eq!(ring.contiguous_end(TimeDelta::minutes(1)), Some(closed(5).open_time));
    }

    #[test]
    fn test_closed_ring_recent_oldest_first() {
        let mut ring = ClosedRing::new(10);
        (1..=5).for_each(|minute| {
            ring.push(closed(minute));
        });

        let recent = ring
            .recent(2)
            .into_iter()
            .map(|candle| candle.open_time)
            .collect::<Vec<_>>();
        assert_eq!(recent, vec![closed(4).open_time, closed(5).open_time]);
        assert_eq!(ring.recent(50).len(), 5);
    }
}
