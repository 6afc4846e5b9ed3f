//! Per-stream candle state.
//!
//! The [`KlineStore`] keeps an explicit registry of [`StreamKey`] to state cell. Each cell sits
//! behind its own lock, so distinct streams progress in parallel while updates, rolls,
//! reconciliation and buffer replay for one stream are serialised and never observed half done.

use crate::{
    bucket::Bucket,
    candle::{Candle, KlineEvent, OpenCandle, StreamKey},
    config::StreamConfig,
    error::StreamError,
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, warn};

pub mod ring;

use ring::ClosedRing;

/// Result of applying one [`KlineEvent`] to a stream.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ApplyOutcome {
    /// A new open candle was seeded with no candle previously open.
    Opened {
        open_time: DateTime<Utc>,
        skipped: u64,
    },
    /// Folded into the current open candle.
    Merged,
    /// The open candle was frozen into the ring and a newer one seeded.
    Rolled {
        closed: Candle,
        opened: DateTime<Utc>,
        skipped: u64,
    },
    /// `source_seq` already applied, nothing changed.
    Duplicate { seq: u64 },
    /// Held while the stream is suspended for recovery.
    Buffered,
}

impl ApplyOutcome {
    /// Whole buckets between the previous candle and the newly opened one that were never
    /// observed.
    pub fn skipped(&self) -> u64 {
        match self {
            ApplyOutcome::Opened { skipped, .. } | ApplyOutcome::Rolled { skipped, .. } => *skipped,
            _ => 0,
        }
    }

    /// Open time of the candle seeded by this update, if any.
    pub fn opened(&self) -> Option<DateTime<Utc>> {
        match self {
            ApplyOutcome::Opened { open_time, .. } => Some(*open_time),
            ApplyOutcome::Rolled { opened, .. } => Some(*opened),
            _ => None,
        }
    }
}

/// Summary of replaying buffered live events.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Replay {
    pub applied: usize,
    pub discarded: usize,
    /// Unobserved buckets crossed during the replay
    pub skipped: u64,
    /// Open time of the first bucket after a skipped run
    pub gap_at: Option<DateTime<Utc>>,
}

/// Summary of merging backfilled candles.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Reconciled {
    pub merged: usize,
    pub superseded_open: bool,
    pub replay: Replay,
}

/// Candle state of one stream.
#[derive(Debug, Clone)]
pub struct StreamState {
    key: StreamKey,
    current: Option<OpenCandle>,
    recent_closed: ClosedRing,
    last_event_time: Option<DateTime<Utc>>,
    last_event_seq: Option<u64>,
}

impl StreamState {
    pub fn new(key: StreamKey, ring_capacity: usize) -> Self {
        Self {
            key,
            current: None,
            recent_closed: ClosedRing::new(ring_capacity),
            last_event_time: None,
            last_event_seq: None,
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn current(&self) -> Option<&OpenCandle> {
        self.current.as_ref()
    }

    pub fn recent_closed(&self) -> &ClosedRing {
        &self.recent_closed
    }

    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.last_event_time
    }

    pub fn last_event_seq(&self) -> Option<u64> {
        self.last_event_seq
    }

    /// Fold one event into the stream.
    ///
    /// Events for a bucket older than the newest known bucket never mutate state: they are
    /// rejected with [`StreamError::OutOfOrderDuplicate`] when that bucket is retained in the
    /// ring and [`StreamError::LateEvent`] otherwise.
    pub fn apply(&mut self, event: KlineEvent) -> Result<ApplyOutcome, StreamError> {
        let bucket = Bucket::containing(event.event_time, self.key.interval)?;

        if self.is_behind_frontier(bucket.open_time) {
            return Err(self.reject_older(bucket.open_time));
        }

        if self
            .last_event_seq
            .is_some_and(|seq| event.source_seq <= seq)
        {
            return Ok(ApplyOutcome::Duplicate {
                seq: event.source_seq,
            });
        }

        let outcome = match self.current.take() {
            None => {
                let skipped = self
                    .recent_closed
                    .newest()
                    .map_or(0, |newest| self.buckets_between(newest.open_time, bucket.open_time));
                self.current = Some(OpenCandle::seed(&self.key, bucket, &event));
                ApplyOutcome::Opened {
                    open_time: bucket.open_time,
                    skipped,
                }
            }
            Some(mut current) if current.open_time() == bucket.open_time => {
                current.merge(&event);
                self.current = Some(current);
                ApplyOutcome::Merged
            }
            Some(current) => {
                let skipped = self.buckets_between(current.open_time(), bucket.open_time);
                let closed = current.freeze();
                if let Some(evicted) = self.recent_closed.push(closed.clone()) {
                    debug!(stream_key = %self.key, open_time = %evicted.open_time, "evicted closed candle");
                }
                self.current = Some(OpenCandle::seed(&self.key, bucket, &event));
                ApplyOutcome::Rolled {
                    closed,
                    opened: bucket.open_time,
                    skipped,
                }
            }
        };

        self.last_event_time = Some(
            self.last_event_time
                .map_or(event.event_time, |last| last.max(event.event_time)),
        );
        self.last_event_seq = Some(event.source_seq);

        Ok(outcome)
    }

    /// Merge validated closed candles into the ring in `open_time` order.
    ///
    /// Buckets already retained, and candles whose bucket has not closed as of `now`, are
    /// skipped, so a backfill may fill holes behind the newest ring entry. An open candle whose
    /// bucket is now covered by the ring is dropped so the live feed reseeds the next bucket.
    pub fn merge_closed(&mut self, candles: Vec<Candle>, now: DateTime<Utc>) -> (usize, bool) {
        let mut merged = 0;
        for mut candle in candles {
            if candle.close_time > now {
                continue;
            }
            candle.is_closed = true;
            if self.recent_closed.insert(candle) {
                merged += 1;
            }
        }

        let covered = match (&self.current, self.recent_closed.newest()) {
            (Some(current), Some(newest)) => current.open_time() <= newest.open_time,
            _ => false,
        };
        if covered {
            self.current = None;
        }

        (merged, covered)
    }

    /// Whether `open_time` precedes the open candle, or is already closed in the ring when no
    /// candle is open.
    fn is_behind_frontier(&self, open_time: DateTime<Utc>) -> bool {
        match (&self.current, self.recent_closed.newest()) {
            (Some(current), _) => open_time < current.open_time(),
            (None, Some(newest)) => open_time <= newest.open_time,
            (None, None) => false,
        }
    }

    fn reject_older(&self, open_time: DateTime<Utc>) -> StreamError {
        if self.recent_closed.contains(open_time) {
            StreamError::OutOfOrderDuplicate {
                key: self.key.clone(),
                open_time,
            }
        } else {
            StreamError::LateEvent {
                key: self.key.clone(),
                open_time,
            }
        }
    }

    fn buckets_between(&self, previous: DateTime<Utc>, next: DateTime<Utc>) -> u64 {
        let steps = (next - previous).num_milliseconds() / self.key.interval.as_millis();
        u64::try_from(steps.saturating_sub(1)).unwrap_or(0)
    }
}

#[derive(Debug)]
struct StreamCell {
    config: StreamConfig,
    state: StreamState,
    buffer: Option<VecDeque<KlineEvent>>,
}

impl StreamCell {
    fn replay(&mut self) -> Replay {
        let mut replay = Replay::default();
        let Some(buffer) = self.buffer.take() else {
            return replay;
        };

        for event in buffer {
            match self.state.apply(event) {
                Ok(outcome) => {
                    if outcome.skipped() > 0 && replay.gap_at.is_none() {
                        replay.gap_at = outcome.opened();
                    }
                    replay.skipped += outcome.skipped();
                    replay.applied += 1;
                }
                Err(error) => {
                    debug!(stream_key = %self.state.key, %error, "discarded buffered event");
                    replay.discarded += 1;
                }
            }
        }

        replay
    }
}

/// Registry of per-stream candle state.
#[derive(Debug, Default)]
pub struct KlineStore {
    streams: RwLock<FnvHashMap<StreamKey, Arc<Mutex<StreamCell>>>>,
}

impl KlineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: StreamKey, config: StreamConfig) -> Result<(), StreamError> {
        let mut streams = self.streams.write();
        if streams.contains_key(&key) {
            return Err(StreamError::AlreadySubscribed(key));
        }

        let cell = StreamCell {
            state: StreamState::new(key.clone(), config.ring_capacity),
            config,
            buffer: None,
        };
        streams.insert(key, Arc::new(Mutex::new(cell)));
        Ok(())
    }

    pub fn remove(&self, key: &StreamKey) -> Result<(), StreamError> {
        self.streams
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StreamError::UnknownStream(key.clone()))
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.streams.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<StreamKey> {
        let mut keys = self.streams.read().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn stream_config(&self, key: &StreamKey) -> Result<StreamConfig, StreamError> {
        Ok(self.cell(key)?.lock().config.clone())
    }

    /// Apply a live event, or buffer it if the stream is suspended.
    pub fn apply_update(
        &self,
        key: &StreamKey,
        event: KlineEvent,
    ) -> Result<ApplyOutcome, StreamError> {
        let cell = self.cell(key)?;
        let mut cell = cell.lock();

        let max_buffered = cell.config.max_buffered_events;
        if let Some(buffer) = cell.buffer.as_mut() {
            if buffer.len() >= max_buffered {
                buffer.pop_front();
                warn!(stream_key = %key, max_buffered, "recovery buffer full, dropped oldest event");
            }
            buffer.push_back(event);
            return Ok(ApplyOutcome::Buffered);
        }

        cell.state.apply(event)
    }

    /// Start buffering live events instead of applying them. Returns `false` if the stream was
    /// already suspended.
    pub fn suspend(&self, key: &StreamKey) -> Result<bool, StreamError> {
        let cell = self.cell(key)?;
        let mut cell = cell.lock();
        if cell.buffer.is_some() {
            return Ok(false);
        }
        cell.buffer = Some(VecDeque::new());
        Ok(true)
    }

    pub fn is_suspended(&self, key: &StreamKey) -> Result<bool, StreamError> {
        Ok(self.cell(key)?.lock().buffer.is_some())
    }

    /// Stop buffering and replay held events without merging anything.
    pub fn resume(&self, key: &StreamKey) -> Result<Replay, StreamError> {
        Ok(self.cell(key)?.lock().replay())
    }

    /// Merge validated closed candles, then replay held events, under one lock acquisition.
    pub fn reconcile(
        &self,
        key: &StreamKey,
        candles: Vec<Candle>,
        now: DateTime<Utc>,
    ) -> Result<Reconciled, StreamError> {
        let cell = self.cell(key)?;
        let mut cell = cell.lock();

        let (merged, superseded_open) = cell.state.merge_closed(candles, now);
        let replay = cell.replay();

        Ok(Reconciled {
            merged,
            superseded_open,
            replay,
        })
    }

    pub fn current_candle(&self, key: &StreamKey) -> Result<Option<Candle>, StreamError> {
        Ok(self
            .cell(key)?
            .lock()
            .state
            .current
            .as_ref()
            .map(OpenCandle::snapshot))
    }

    /// Newest `limit` closed candles, oldest first.
    pub fn recent_closed(&self, key: &StreamKey, limit: usize) -> Result<Vec<Candle>, StreamError> {
        Ok(self.cell(key)?.lock().state.recent_closed.recent(limit))
    }

    /// `open_time` of the closed candle backfill continues from: the newest one, or the last one
    /// before the first hole in the ring.
    pub fn recovery_anchor(&self, key: &StreamKey) -> Result<Option<DateTime<Utc>>, StreamError> {
        Ok(self
            .cell(key)?
            .lock()
            .state
            .recent_closed
            .contiguous_end(key.interval.duration()))
    }

    fn cell(&self, key: &StreamKey) -> Result<Arc<Mutex<StreamCell>>, StreamError> {
        self.streams
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StreamError::UnknownStream(key.clone()))
    }
}
