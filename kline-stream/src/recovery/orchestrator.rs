use super::{
    BackfillRange, RecoveryPhase, RecoverySession, RecoveryTrigger, backoff_delay,
    reconcile::validate_backfill,
};
use crate::{
    bucket::bucket_start,
    candle::{Candle, StreamKey},
    clock::Clock,
    collaborator::{BackfillSource, ConnectionManager},
    config::RecoveryConfig,
    error::StreamError,
    health::HealthMonitor,
    store::{KlineStore, Reconciled},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct ActiveSession {
    id: u64,
    session: RecoverySession,
    cancel: CancellationToken,
}

/// Exclusive claim on one stream's recovery, handed out by [`RecoveryOrchestrator::begin`].
#[derive(Debug)]
pub struct RecoveryTicket {
    id: u64,
    key: StreamKey,
    cancel: CancellationToken,
}

impl RecoveryTicket {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Recovered {
    pub key: StreamKey,
    /// Failed attempts before the successful one
    pub attempts: u32,
    pub reconciled: Reconciled,
}

/// Drives at most one [`RecoverySession`] per stream.
///
/// A session suspends live application for its stream, reconnects, backfills from the newest
/// contiguous closed candle, validates continuity and reconciles. Failed steps are retried with
/// exponential backoff until [`RecoveryConfig::max_attempts`] is reached, after which the
/// stream is left FAILED with its buffered events replayed and the error retained until
/// [`RecoveryOrchestrator::reset`].
#[derive(Debug)]
pub struct RecoveryOrchestrator<Connection, Backfill, Clk> {
    store: Arc<KlineStore>,
    monitor: Arc<HealthMonitor>,
    connection: Arc<Connection>,
    backfill: Arc<Backfill>,
    clock: Arc<Clk>,
    config: RecoveryConfig,
    next_session_id: AtomicU64,
    sessions: Mutex<FnvHashMap<StreamKey, ActiveSession>>,
    failures: Mutex<FnvHashMap<StreamKey, StreamError>>,
}

impl<Connection, Backfill, Clk> RecoveryOrchestrator<Connection, Backfill, Clk>
where
    Connection: ConnectionManager,
    Backfill: BackfillSource,
    Clk: Clock,
{
    pub fn new(
        store: Arc<KlineStore>,
        monitor: Arc<HealthMonitor>,
        connection: Arc<Connection>,
        backfill: Arc<Backfill>,
        clock: Arc<Clk>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            monitor,
            connection,
            backfill,
            clock,
            config,
            next_session_id: AtomicU64::new(0),
            sessions: Mutex::new(FnvHashMap::default()),
            failures: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Claim a stream for recovery, suspend its live application and latch it RECOVERING.
    ///
    /// Fails with [`StreamError::RecoveryActive`] if a session already exists, and with the
    /// retained error if the stream is FAILED.
    pub fn begin(
        &self,
        key: &StreamKey,
        trigger: RecoveryTrigger,
    ) -> Result<RecoveryTicket, StreamError> {
        self.claim(key, trigger, RecoveryPhase::DetectingStale)
    }

    /// Run a claimed session to completion, cancellation or terminal failure.
    pub async fn run(&self, ticket: RecoveryTicket) -> Result<Recovered, StreamError> {
        let RecoveryTicket { id, key, cancel } = ticket;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamError::RecoveryCancelled(key.clone())),
            result = self.drive(id, &key) => result,
        };

        self.finish(id, &key, result)
    }

    /// Claim and run in one call.
    pub async fn recover(
        &self,
        key: &StreamKey,
        trigger: RecoveryTrigger,
    ) -> Result<Recovered, StreamError> {
        let ticket = self.begin(key, trigger)?;
        self.run(ticket).await
    }

    /// Seed an empty ring with the last `ring_capacity` closed candles.
    ///
    /// Holds the stream's recovery claim for the duration, so live events are buffered and
    /// replayed on top of the loaded history and no other session can start meanwhile.
    /// Transient failures are retried with the recovery backoff policy. A failed bootstrap
    /// replays the buffer and retains no failure, the ring then fills from the live feed.
    pub async fn bootstrap(&self, key: &StreamKey) -> Result<Reconciled, StreamError> {
        let RecoveryTicket { id, key, cancel } =
            self.claim(key, RecoveryTrigger::Bootstrap, RecoveryPhase::Backfilling)?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamError::RecoveryCancelled(key.clone())),
            result = self.load_history(id, &key) => result,
        };

        self.finish_bootstrap(id, &key, result)
    }

    /// Abort the in-flight session for `key` at its next await point.
    pub fn cancel(&self, key: &StreamKey) -> Result<(), StreamError> {
        self.sessions
            .lock()
            .get(key)
            .map(|active| active.cancel.cancel())
            .ok_or_else(|| StreamError::RecoveryInactive(key.clone()))
    }

    /// Clear a retained failure so the stream can recover again. Returns whether one existed.
    pub fn reset(&self, key: &StreamKey) -> Result<bool, StreamError> {
        let Some(failure) = self.failures.lock().remove(key) else {
            return Ok(false);
        };
        self.monitor.restore(key, self.clock.now())?;
        info!(stream_key = %key, %failure, "recovery failure reset");
        Ok(true)
    }

    /// Drop every trace of a stream, cancelling an in-flight session.
    pub fn forget(&self, key: &StreamKey) {
        if let Some(active) = self.sessions.lock().remove(key) {
            active.cancel.cancel();
        }
        self.failures.lock().remove(key);
    }

    pub fn session(&self, key: &StreamKey) -> Option<RecoverySession> {
        self.sessions
            .lock()
            .get(key)
            .map(|active| active.session.clone())
    }

    pub fn phase(&self, key: &StreamKey) -> RecoveryPhase {
        if let Some(active) = self.sessions.lock().get(key) {
            return active.session.phase;
        }
        if self.failures.lock().contains_key(key) {
            RecoveryPhase::Failed
        } else {
            RecoveryPhase::Idle
        }
    }

    pub fn failure(&self, key: &StreamKey) -> Option<StreamError> {
        self.failures.lock().get(key).cloned()
    }

    pub fn is_active(&self, key: &StreamKey) -> bool {
        self.sessions.lock().contains_key(key)
    }

    fn claim(
        &self,
        key: &StreamKey,
        trigger: RecoveryTrigger,
        phase: RecoveryPhase,
    ) -> Result<RecoveryTicket, StreamError> {
        if !self.store.contains(key) {
            return Err(StreamError::UnknownStream(key.clone()));
        }

        let mut sessions = self.sessions.lock();
        if sessions.contains_key(key) {
            return Err(StreamError::RecoveryActive(key.clone()));
        }
        if let Some(failure) = self.failures.lock().get(key) {
            return Err(failure.clone());
        }

        let mut session = RecoverySession::new(key.clone(), trigger, self.clock.now());
        session.advance(phase)?;

        // Live events are held from here until reconciliation or failure
        if !self.store.suspend(key)? {
            return Err(StreamError::RecoveryActive(key.clone()));
        }
        if let Err(error) = self.monitor.mark_recovering(key) {
            self.store.resume(key)?;
            return Err(error);
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        sessions.insert(
            key.clone(),
            ActiveSession {
                id,
                session,
                cancel: cancel.clone(),
            },
        );

        info!(stream_key = %key, %trigger, "recovery started");
        Ok(RecoveryTicket {
            id,
            key: key.clone(),
            cancel,
        })
    }

    /// The session `id` still owns `key`, if it was not forgotten meanwhile.
    fn owned_session(&self, id: u64, key: &StreamKey) -> Result<RecoverySession, StreamError> {
        self.sessions
            .lock()
            .get(key)
            .filter(|active| active.id == id)
            .map(|active| active.session.clone())
            .ok_or_else(|| StreamError::RecoveryInactive(key.clone()))
    }

    async fn drive(&self, id: u64, key: &StreamKey) -> Result<Recovered, StreamError> {
        let mut session = self.owned_session(id, key)?;
        session.advance(RecoveryPhase::Reconnecting)?;
        self.publish(id, &session);

        loop {
            let step = match session.phase {
                RecoveryPhase::Reconnecting => {
                    self.reconnect(id, &mut session).await.map(|()| None)
                }
                RecoveryPhase::Backfilling => self.backfill(id, &mut session).await.map(Some),
                phase => {
                    return Err(StreamError::InvalidTransition {
                        from: phase,
                        to: RecoveryPhase::Idle,
                    });
                }
            };

            let error = match step {
                Ok(Some(reconciled)) => {
                    return Ok(Recovered {
                        key: key.clone(),
                        attempts: session.attempts,
                        reconciled,
                    });
                }
                Ok(None) => continue,
                Err(error) => error,
            };

            session.attempts += 1;
            session.last_error = Some(error.clone());
            self.publish(id, &session);

            if !error.is_retryable() {
                return Err(error);
            }
            if session.attempts >= self.config.max_attempts {
                return Err(StreamError::RecoveryExhausted {
                    key: key.clone(),
                    attempts: session.attempts,
                });
            }

            let delay = backoff_delay(&self.config, session.attempts);
            warn!(
                stream_key = %key,
                phase = %session.phase,
                attempt = session.attempts,
                backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %error,
                "recovery attempt failed, retrying"
            );
            self.clock.sleep(delay).await;
            session.advance(session.phase)?;
        }
    }

    async fn reconnect(&self, id: u64, session: &mut RecoverySession) -> Result<(), StreamError> {
        let key = session.stream_key.clone();
        debug!(stream_key = %key, attempt = session.attempts, "reconnecting");

        match tokio::time::timeout(self.config.attempt_timeout, self.connection.reconnect(&key))
            .await
        {
            Err(_) => return Err(StreamError::AttemptTimeout),
            Ok(Err(error)) => {
                return Err(StreamError::ReconnectFailure {
                    key,
                    reason: error.to_string(),
                });
            }
            Ok(Ok(())) => {}
        }

        session.advance(RecoveryPhase::Backfilling)?;
        self.publish(id, session);
        Ok(())
    }

    async fn backfill(
        &self,
        id: u64,
        session: &mut RecoverySession,
    ) -> Result<Reconciled, StreamError> {
        let key = session.stream_key.clone();
        let interval = key.interval.duration();
        let anchor = self.store.recovery_anchor(&key)?;
        let now = self.clock.now();

        let from = match anchor {
            Some(anchor) => anchor + interval,
            None => self.history_start(&key, now)?,
        };
        session.last_known_closed_open_time = anchor;
        session.backfill_range = Some(BackfillRange { from, to: now });
        self.publish(id, session);

        let candles = self.fetch(&key, from, now).await?;

        session.advance(RecoveryPhase::Reconciling)?;
        self.publish(id, session);

        let candles = match validate_backfill(&key, anchor, candles, now) {
            Ok(candles) => candles,
            Err(error) => {
                session.advance(RecoveryPhase::Backfilling)?;
                return Err(error);
            }
        };

        let reconciled = self.store.reconcile(&key, candles, now)?;
        session.advance(RecoveryPhase::Idle)?;
        self.publish(id, session);
        Ok(reconciled)
    }

    async fn load_history(&self, id: u64, key: &StreamKey) -> Result<Reconciled, StreamError> {
        let mut session = self.owned_session(id, key)?;

        // Only an empty ring is seeded, the buffered events are still replayed
        if self.store.recovery_anchor(key)?.is_some() {
            return self.store.reconcile(key, Vec::new(), self.clock.now());
        }

        loop {
            let now = self.clock.now();
            let from = self.history_start(key, now)?;
            session.backfill_range = Some(BackfillRange { from, to: now });
            self.publish(id, &session);

            let loaded = self
                .fetch(key, from, now)
                .await
                .and_then(|candles| validate_backfill(key, None, candles, now));
            let error = match loaded {
                Ok(candles) => return self.store.reconcile(key, candles, now),
                Err(error) => error,
            };

            session.attempts += 1;
            session.last_error = Some(error.clone());
            self.publish(id, &session);

            if !error.is_retryable() || session.attempts >= self.config.max_attempts {
                return Err(error);
            }

            let delay = backoff_delay(&self.config, session.attempts);
            warn!(
                stream_key = %key,
                attempt = session.attempts,
                backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %error,
                "bootstrap attempt failed, retrying"
            );
            self.clock.sleep(delay).await;
        }
    }

    /// Open time of the oldest bucket a full ring would retain as of `now`.
    fn history_start(
        &self,
        key: &StreamKey,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StreamError> {
        let capacity = self.store.stream_config(key)?.ring_capacity;
        Ok(bucket_start(now, key.interval.duration())?
            - key.interval.times(i64::try_from(capacity).unwrap_or(i64::MAX)))
    }

    async fn fetch(
        &self,
        key: &StreamKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StreamError> {
        debug!(stream_key = %key, %from, %to, "backfilling");
        let candles = tokio::time::timeout(
            self.config.attempt_timeout,
            self.backfill.fetch_candles(&key.symbol, key.interval, from, to),
        )
        .await
        .map_err(|_| StreamError::AttemptTimeout)??;
        Ok(candles)
    }

    fn publish(&self, id: u64, session: &RecoverySession) {
        if let Some(active) = self
            .sessions
            .lock()
            .get_mut(&session.stream_key)
            .filter(|active| active.id == id)
        {
            active.session = session.clone();
        }
    }

    fn finish(
        &self,
        id: u64,
        key: &StreamKey,
        result: Result<Recovered, StreamError>,
    ) -> Result<Recovered, StreamError> {
        let mut sessions = self.sessions.lock();
        if !release(&mut sessions, id, key) {
            // Forgotten while running, the key is gone or belongs to a later subscription
            return result;
        }

        match result {
            Ok(recovered) => {
                drop(sessions);
                self.monitor.restore(key, self.clock.now())?;
                info!(
                    stream_key = %key,
                    attempts = recovered.attempts,
                    merged = recovered.reconciled.merged,
                    replayed = recovered.reconciled.replay.applied,
                    "recovery complete"
                );
                Ok(recovered)
            }
            Err(failure) => {
                self.failures.lock().insert(key.clone(), failure.clone());
                match self.store.resume(key) {
                    Ok(replay) => debug!(stream_key = %key, ?replay, "replayed buffered events"),
                    Err(error) => warn!(stream_key = %key, %error, "failed to replay buffered events"),
                }
                if let Err(error) = self.monitor.mark_failed(key) {
                    warn!(stream_key = %key, %error, "failed to mark stream failed");
                }
                drop(sessions);

                error!(stream_key = %key, %failure, "recovery failed");
                Err(failure)
            }
        }
    }

    fn finish_bootstrap(
        &self,
        id: u64,
        key: &StreamKey,
        result: Result<Reconciled, StreamError>,
    ) -> Result<Reconciled, StreamError> {
        let mut sessions = self.sessions.lock();
        if !release(&mut sessions, id, key) {
            return result;
        }

        if result.is_err() {
            match self.store.resume(key) {
                Ok(replay) => debug!(stream_key = %key, ?replay, "replayed buffered events"),
                Err(error) => warn!(stream_key = %key, %error, "failed to replay buffered events"),
            }
        }
        if let Err(error) = self.monitor.restore(key, self.clock.now()) {
            warn!(stream_key = %key, %error, "failed to restore stream health");
        }
        drop(sessions);

        match &result {
            Ok(reconciled) => {
                info!(stream_key = %key, loaded = reconciled.merged, "bootstrapped closed history")
            }
            Err(error) => error!(stream_key = %key, %error, "bootstrap failed"),
        }
        result
    }
}

/// Remove session `id` from `key`, leaving a later session of a resubscribed stream alone.
fn release(sessions: &mut FnvHashMap<StreamKey, ActiveSession>, id: u64, key: &StreamKey) -> bool {
    if !sessions.get(key).is_some_and(|active| active.id == id) {
        return false;
    }
    sessions.remove(key);
    true
}
