//! Stream staleness tracking.
//!
//! The [`HealthMonitor`] records when each stream last produced an accepted event and computes
//! a [`HealthRecord`] on demand. The recovery orchestrator latches RECOVERING for the life of a
//! session and FAILED after a terminal failure; live events never clear either.

use crate::{candle::StreamKey, error::StreamError};
use chrono::{DateTime, TimeDelta, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[display("HEALTHY")]
    Healthy,
    #[display("STALE")]
    Stale,
    #[display("RECOVERING")]
    Recovering,
    #[display("FAILED")]
    Failed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HealthRecord {
    pub stream_key: StreamKey,
    pub last_update_time: DateTime<Utc>,
    pub status: HealthStatus,
    pub stale_threshold: TimeDelta,
}

impl HealthRecord {
    /// Time since the last accepted event as of `now`.
    pub fn silence(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.last_update_time
    }
}

/// Staleness of a stream from timestamps alone.
///
/// Silence exactly equal to the threshold is still [`HealthStatus::Healthy`].
pub fn evaluate(
    last_update_time: DateTime<Utc>,
    stale_threshold: TimeDelta,
    now: DateTime<Utc>,
) -> HealthStatus {
    if now - last_update_time > stale_threshold {
        HealthStatus::Stale
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Latch {
    Clear,
    Recovering,
    Failed,
}

#[derive(Debug, Clone)]
struct HealthEntry {
    last_update_time: DateTime<Utc>,
    stale_threshold: TimeDelta,
    latch: Latch,
}

impl HealthEntry {
    fn record(&self, stream_key: &StreamKey, now: DateTime<Utc>) -> HealthRecord {
        let status = match self.latch {
            Latch::Failed => HealthStatus::Failed,
            Latch::Recovering => HealthStatus::Recovering,
            Latch::Clear => evaluate(self.last_update_time, self.stale_threshold, now),
        };

        HealthRecord {
            stream_key: stream_key.clone(),
            last_update_time: self.last_update_time,
            status,
            stale_threshold: self.stale_threshold,
        }
    }
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    entries: RwLock<FnvHashMap<StreamKey, HealthEntry>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a stream. The silence clock starts at `now`.
    pub fn register(
        &self,
        key: StreamKey,
        stale_threshold: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<(), StreamError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(StreamError::AlreadySubscribed(key));
        }
        entries.insert(
            key,
            HealthEntry {
                last_update_time: now,
                stale_threshold,
                latch: Latch::Clear,
            },
        );
        Ok(())
    }

    pub fn deregister(&self, key: &StreamKey) -> Result<(), StreamError> {
        self.entries
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StreamError::UnknownStream(key.clone()))
    }

    /// Note an accepted event. `last_update_time` only moves forward.
    pub fn record_event(
        &self,
        key: &StreamKey,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StreamError> {
        self.with_entry(key, |entry| {
            entry.last_update_time = entry.last_update_time.max(observed_at);
        })
    }

    pub fn get_health(
        &self,
        key: &StreamKey,
        now: DateTime<Utc>,
    ) -> Result<HealthRecord, StreamError> {
        self.entries
            .read()
            .get(key)
            .map(|entry| entry.record(key, now))
            .ok_or_else(|| StreamError::UnknownStream(key.clone()))
    }

    /// Every tracked stream, ordered by key.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<HealthRecord> {
        let mut records = self
            .entries
            .read()
            .iter()
            .map(|(key, entry)| entry.record(key, now))
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.stream_key.cmp(&b.stream_key));
        records
    }

    pub fn mark_recovering(&self, key: &StreamKey) -> Result<(), StreamError> {
        self.latch(key, Latch::Recovering)
    }

    pub fn mark_failed(&self, key: &StreamKey) -> Result<(), StreamError> {
        self.latch(key, Latch::Failed)
    }

    /// Clear any latched flag and restart the silence clock at `now`.
    pub fn restore(&self, key: &StreamKey, now: DateTime<Utc>) -> Result<(), StreamError> {
        self.with_entry(key, |entry| {
            entry.latch = Latch::Clear;
            entry.last_update_time = entry.last_update_time.max(now);
        })
    }

    fn latch(&self, key: &StreamKey, latch: Latch) -> Result<(), StreamError> {
        self.with_entry(key, |entry| entry.latch = latch)
    }

    fn with_entry<F>(&self, key: &StreamKey, f: F) -> Result<(), StreamError>
    where
        F: FnOnce(&mut HealthEntry),
    {
        self.entries
            .write()
            .get_mut(key)
            .map(f)
            .ok_or_else(|| StreamError::UnknownStream(key.clone()))
    }
}
