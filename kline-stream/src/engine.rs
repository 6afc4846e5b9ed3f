//! The coordinating component.
//!
//! [`KlineEngine`] owns the stream registry shared by the [`KlineStore`] and the
//! [`HealthMonitor`], feeds transport messages into them, runs the periodic staleness sweep and
//! spawns recoveries through the [`RecoveryOrchestrator`].

use crate::{
    bucket::bucket_start,
    candle::{Candle, KlineEvent, StreamKey},
    clock::{Clock, SystemClock},
    collaborator::{BackfillSource, ConnectionManager, FeedMessage},
    config::{EngineConfig, StreamConfig},
    coverage::CoverageTracker,
    error::StreamError,
    health::{HealthMonitor, HealthRecord, HealthStatus},
    recovery::{
        RecoveryPhase, RecoverySession, RecoveryTrigger,
        orchestrator::{Recovered, RecoveryOrchestrator},
    },
    store::{ApplyOutcome, KlineStore, Replay},
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct KlineEngine<Connection, Backfill, Clk = SystemClock> {
    config: EngineConfig,
    store: Arc<KlineStore>,
    monitor: Arc<HealthMonitor>,
    connection: Arc<Connection>,
    clock: Arc<Clk>,
    orchestrator: Arc<RecoveryOrchestrator<Connection, Backfill, Clk>>,
    coverage: CoverageTracker,
}

impl<Connection, Backfill, Clk> KlineEngine<Connection, Backfill, Clk>
where
    Connection: ConnectionManager,
    Backfill: BackfillSource,
    Clk: Clock,
{
    pub fn new(
        config: EngineConfig,
        connection: Arc<Connection>,
        backfill: Arc<Backfill>,
        clock: Arc<Clk>,
    ) -> Result<Self, StreamError> {
        config.validate()?;

        let store = Arc::new(KlineStore::new());
        let monitor = Arc::new(HealthMonitor::new());
        let orchestrator = Arc::new(RecoveryOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&monitor),
            Arc::clone(&connection),
            backfill,
            Arc::clone(&clock),
            config.recovery.clone(),
        ));

        Ok(Self {
            config,
            store,
            monitor,
            connection,
            clock,
            orchestrator,
            coverage: CoverageTracker::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stream_keys(&self) -> Vec<StreamKey> {
        self.store.keys()
    }

    /// Register a stream and open its connection. `None` uses the engine's default
    /// [`StreamConfig`].
    pub async fn subscribe(
        &self,
        key: StreamKey,
        config: Option<StreamConfig>,
    ) -> Result<(), StreamError> {
        let config = config.unwrap_or_else(|| self.config.stream.clone());
        config.validate()?;

        let stale_threshold = config.stale_threshold(key.interval);
        self.store.insert(key.clone(), config)?;
        if let Err(error) = self
            .monitor
            .register(key.clone(), stale_threshold, self.clock.now())
        {
            let _ = self.store.remove(&key);
            return Err(error);
        }

        if let Err(error) = self.connection.subscribe(&key).await {
            let _ = self.store.remove(&key);
            let _ = self.monitor.deregister(&key);
            return Err(error.into());
        }

        self.coverage.register(&key);
        info!(
            stream_key = %key,
            stale_threshold_ms = stale_threshold.num_milliseconds(),
            "subscribed"
        );
        Ok(())
    }

    pub async fn unsubscribe(&self, key: &StreamKey) -> Result<(), StreamError> {
        self.orchestrator.forget(key);
        self.store.remove(key)?;
        self.monitor.deregister(key)?;
        self.coverage.deregister(key);

        if let Err(error) = self.connection.unsubscribe(key).await {
            warn!(stream_key = %key, %error, "failed to close connection");
        }

        info!(stream_key = %key, "unsubscribed");
        Ok(())
    }

    /// Seed an empty ring with the last `ring_capacity` closed candles.
    ///
    /// Live events are buffered while the history loads and replayed on top of it. Returns the
    /// number of candles loaded, zero if the stream already has closed history.
    pub async fn bootstrap(self: &Arc<Self>, key: &StreamKey) -> Result<usize, StreamError> {
        let reconciled = self.orchestrator.bootstrap(key).await?;
        self.check_replay(key, &reconciled.replay);
        Ok(reconciled.merged)
    }

    /// Apply one live event and note it with the health monitor and the bucket coverage.
    pub fn apply_update(
        &self,
        key: &StreamKey,
        event: KlineEvent,
    ) -> Result<ApplyOutcome, StreamError> {
        let event_time = event.event_time;
        let outcome = match self.store.apply_update(key, event) {
            Ok(outcome) => outcome,
            Err(error @ StreamError::OutOfOrderDuplicate { .. }) => {
                debug!(%error, "discarded out-of-order duplicate");
                return Err(error);
            }
            Err(error @ StreamError::LateEvent { .. }) => {
                warn!(%error, "discarded late event");
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        match &outcome {
            ApplyOutcome::Duplicate { seq } => {
                debug!(stream_key = %key, seq, "ignored duplicate event");
            }
            ApplyOutcome::Buffered => self.monitor.record_event(key, self.clock.now())?,
            ApplyOutcome::Opened { .. } | ApplyOutcome::Merged | ApplyOutcome::Rolled { .. } => {
                self.monitor.record_event(key, self.clock.now())?;
                if let Ok(open_time) = bucket_start(event_time, key.interval.duration()) {
                    self.note_coverage(key, open_time);
                }
            }
        }

        Ok(outcome)
    }

    fn note_coverage(&self, key: &StreamKey, open_time: DateTime<Utc>) {
        let Some(summary) = self.coverage.record(key, open_time) else {
            return;
        };

        if summary.is_complete() {
            info!(
                interval = %summary.interval,
                open_time = %summary.open_time,
                updated = summary.updated,
                expected = summary.expected,
                "bucket coverage complete"
            );
        } else {
            warn!(
                interval = %summary.interval,
                open_time = %summary.open_time,
                updated = summary.updated,
                expected = summary.expected,
                missing = %summary.missing.iter().join(","),
                "bucket coverage incomplete"
            );
        }
    }

    /// Route one transport message. Gaps and disconnects spawn a recovery.
    pub fn handle(self: &Arc<Self>, message: FeedMessage) {
        match message {
            FeedMessage::Event { key, event } => match self.apply_update(&key, event) {
                Ok(outcome) => {
                    if let Some(violation) = gap_violation(&key, &outcome) {
                        error!(error = %violation, "consistency violation, forcing recovery");
                        self.trigger(&key, RecoveryTrigger::ConsistencyViolation);
                    }
                }
                Err(StreamError::UnknownStream(key)) => {
                    debug!(stream_key = %key, "event for unsubscribed stream");
                }
                Err(
                    StreamError::OutOfOrderDuplicate { .. } | StreamError::LateEvent { .. },
                ) => {}
                Err(error) => warn!(stream_key = %key, %error, "event rejected"),
            },
            FeedMessage::Disconnected(key) => {
                warn!(stream_key = %key, "stream disconnected");
                self.trigger(&key, RecoveryTrigger::Disconnected);
            }
            FeedMessage::Reconnected(key) => {
                info!(stream_key = %key, "stream reconnected");
            }
        }
    }

    /// Consume the transport feed until every sender is dropped.
    pub async fn run_feed(self: Arc<Self>, mut feed: mpsc::Receiver<FeedMessage>) {
        while let Some(message) = feed.recv().await {
            self.handle(message);
        }
        info!("feed closed");
    }

    /// Start recovery for every STALE stream. Returns the streams a session was started for.
    pub fn sweep(self: &Arc<Self>) -> Vec<StreamKey> {
        let now = self.clock.now();
        self.monitor
            .snapshot(now)
            .into_iter()
            .filter(|record| record.status == HealthStatus::Stale)
            .filter_map(|record| {
                warn!(
                    stream_key = %record.stream_key,
                    silence_ms = record.silence(now).num_milliseconds(),
                    stale_threshold_ms = record.stale_threshold.num_milliseconds(),
                    "stream stale"
                );
                self.trigger(&record.stream_key, RecoveryTrigger::Stale)
                    .then_some(record.stream_key)
            })
            .collect()
    }

    /// Run [`Self::sweep`] every `sweep_interval` until cancelled.
    pub async fn run_monitor(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        info!("health monitor stopped");
    }

    /// Spawn a recovery session for `key`.
    pub fn recover(
        self: &Arc<Self>,
        key: &StreamKey,
        trigger: RecoveryTrigger,
    ) -> Result<JoinHandle<Result<Recovered, StreamError>>, StreamError> {
        let ticket = self.orchestrator.begin(key, trigger)?;
        let engine = Arc::clone(self);

        Ok(tokio::spawn(async move {
            let result = engine.orchestrator.run(ticket).await;
            if let Ok(recovered) = &result {
                engine.check_replay(&recovered.key, &recovered.reconciled.replay);
            }
            result
        }))
    }

    pub fn cancel_recovery(&self, key: &StreamKey) -> Result<(), StreamError> {
        self.orchestrator.cancel(key)
    }

    /// Clear a terminal failure and start a fresh recovery.
    pub fn retry(
        self: &Arc<Self>,
        key: &StreamKey,
    ) -> Result<JoinHandle<Result<Recovered, StreamError>>, StreamError> {
        self.orchestrator.reset(key)?;
        self.recover(key, RecoveryTrigger::Manual)
    }

    pub fn get_current_candle(&self, key: &StreamKey) -> Result<Option<Candle>, StreamError> {
        self.store.current_candle(key)
    }

    /// Newest `limit` closed candles, oldest first.
    pub fn get_recent_closed(
        &self,
        key: &StreamKey,
        limit: usize,
    ) -> Result<Vec<Candle>, StreamError> {
        self.store.recent_closed(key, limit)
    }

    pub fn get_health(&self, key: &StreamKey) -> Result<HealthRecord, StreamError> {
        self.monitor.get_health(key, self.clock.now())
    }

    pub fn health_snapshot(&self) -> Vec<HealthRecord> {
        self.monitor.snapshot(self.clock.now())
    }

    pub fn recovery_phase(&self, key: &StreamKey) -> Result<RecoveryPhase, StreamError> {
        self.ensure_known(key)?;
        Ok(self.orchestrator.phase(key))
    }

    pub fn recovery_session(&self, key: &StreamKey) -> Option<RecoverySession> {
        self.orchestrator.session(key)
    }

    pub fn recovery_failure(&self, key: &StreamKey) -> Option<StreamError> {
        self.orchestrator.failure(key)
    }

    fn trigger(self: &Arc<Self>, key: &StreamKey, trigger: RecoveryTrigger) -> bool {
        match self.recover(key, trigger) {
            Ok(_) => true,
            Err(error) => {
                debug!(stream_key = %key, %trigger, %error, "recovery not started");
                false
            }
        }
    }

    /// Start a consistency recovery if replaying buffered events crossed unobserved buckets.
    fn check_replay(self: &Arc<Self>, key: &StreamKey, replay: &Replay) {
        if replay.skipped == 0 {
            return;
        }
        error!(
            stream_key = %key,
            gap_at = ?replay.gap_at,
            skipped = replay.skipped,
            "gap while replaying buffered events, forcing recovery"
        );
        self.trigger(key, RecoveryTrigger::ConsistencyViolation);
    }

    fn ensure_known(&self, key: &StreamKey) -> Result<(), StreamError> {
        if self.store.contains(key) {
            Ok(())
        } else {
            Err(StreamError::UnknownStream(key.clone()))
        }
    }
}

/// Unobserved buckets behind a newly opened candle, as a consistency violation.
fn gap_violation(key: &StreamKey, outcome: &ApplyOutcome) -> Option<StreamError> {
    let skipped = outcome.skipped();
    if skipped == 0 {
        return None;
    }
    let found = outcome.opened()?;
    Some(StreamError::ConsistencyViolation {
        key: key.clone(),
        expected: found - key.interval.times(i64::try_from(skipped).unwrap_or(i64::MAX)),
        found,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use chrono::{DateTime, TimeZone, Utc};

    #[test]
    fn test_gap_violation() {
        let key = StreamKey::new("BTCUSDT", Interval::from_hours(1));
        let at = |hour| Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap();

        struct TestCase {
            input: ApplyOutcome,
            expected: Option<(DateTime<Utc>, DateTime<Utc>)>,
        }

        let tests = vec![
            TestCase {
                // TC0: contiguous open
                input: ApplyOutcome::Opened {
                    open_time: at(13),
                    skipped: 0,
                },
                expected: None,
            },
            TestCase {
                // TC1: two buckets never observed
                input: ApplyOutcome::Opened {
                    open_time: at(13),
                    skipped: 2,
                },
                expected: Some((at(11), at(13))),
            },
            TestCase {
                // TC2: merge never violates
                input: ApplyOutcome::Merged,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = gap_violation(&key, &test.input).map(|violation| match violation {
                StreamError::ConsistencyViolation {
                    expected, found, ..
                } => (expected, found),
                other => panic!("unexpected error {other:?}"),
            });
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
