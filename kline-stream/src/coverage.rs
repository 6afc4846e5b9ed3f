//! Cross-stream bucket coverage.
//!
//! Streams that share an interval open their buckets at the same instants. The
//! [`CoverageTracker`] notes which subscribed symbols delivered an update for the newest bucket
//! of each interval and, when the first update of a newer bucket arrives, summarises the
//! previous one.

use crate::{candle::StreamKey, interval::Interval};
use chrono::{DateTime, Utc};
use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::collections::BTreeSet;

/// Which subscribed symbols updated one bucket.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CoverageSummary {
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub updated: usize,
    pub expected: usize,
    /// Subscribed symbols without any update for the bucket, sorted
    pub missing: Vec<SmolStr>,
}

impl CoverageSummary {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Default)]
struct IntervalCoverage {
    subscribed: BTreeSet<SmolStr>,
    open_time: Option<DateTime<Utc>>,
    updated: FnvHashSet<SmolStr>,
}

impl IntervalCoverage {
    fn summarise(&self, interval: Interval, open_time: DateTime<Utc>) -> CoverageSummary {
        let missing = self
            .subscribed
            .iter()
            .filter(|symbol| !self.updated.contains(*symbol))
            .cloned()
            .collect::<Vec<_>>();

        CoverageSummary {
            interval,
            open_time,
            updated: self.subscribed.len() - missing.len(),
            expected: self.subscribed.len(),
            missing,
        }
    }
}

#[derive(Debug, Default)]
pub struct CoverageTracker {
    intervals: Mutex<FnvHashMap<Interval, IntervalCoverage>>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &StreamKey) {
        self.intervals
            .lock()
            .entry(key.interval)
            .or_default()
            .subscribed
            .insert(key.symbol.clone());
    }

    pub fn deregister(&self, key: &StreamKey) {
        let mut intervals = self.intervals.lock();
        let Some(coverage) = intervals.get_mut(&key.interval) else {
            return;
        };
        coverage.subscribed.remove(&key.symbol);
        if coverage.subscribed.is_empty() {
            intervals.remove(&key.interval);
        }
    }

    /// Note an update of `key` for the bucket opening at `open_time`.
    ///
    /// Returns the summary of the previous bucket when this is the first update of a newer one.
    /// Updates for buckets older than the tracked one, and for unregistered streams, are
    /// ignored.
    pub fn record(&self, key: &StreamKey, open_time: DateTime<Utc>) -> Option<CoverageSummary> {
        let mut intervals = self.intervals.lock();
        let coverage = intervals.get_mut(&key.interval)?;
        if !coverage.subscribed.contains(&key.symbol) {
            return None;
        }

        let summary = match coverage.open_time {
            Some(current) if open_time < current => return None,
            Some(current) if open_time == current => None,
            Some(current) => Some(coverage.summarise(key.interval, current)),
            None => None,
        };

        if coverage.open_time != Some(open_time) {
            coverage.open_time = Some(open_time);
            coverage.updated.clear();
        }
        coverage.updated.insert(key.symbol.clone());

        summary
    }
}
