use crate::{candle::StreamKey, recovery::RecoveryPhase};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// All errors generated in `kline-stream`.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StreamError {
    #[error("interval must be strictly positive, got {0}ms")]
    NonPositiveInterval(i64),

    #[error("unsupported interval: {0}")]
    UnsupportedInterval(String),

    #[error("timestamp out of range: {0}ms")]
    TimestampOutOfRange(i64),

    #[error("unknown stream: {0}")]
    UnknownStream(StreamKey),

    #[error("stream already subscribed: {0}")]
    AlreadySubscribed(StreamKey),

    #[error("{key}: discarded out-of-order duplicate for already closed bucket {open_time}")]
    OutOfOrderDuplicate {
        key: StreamKey,
        open_time: DateTime<Utc>,
    },

    #[error("{key}: late event for bucket {open_time} which was never observed")]
    LateEvent {
        key: StreamKey,
        open_time: DateTime<Utc>,
    },

    #[error("{key}: consistency violation, expected bucket {expected} but found {found}")]
    ConsistencyViolation {
        key: StreamKey,
        expected: DateTime<Utc>,
        found: DateTime<Utc>,
    },

    #[error("{key}: backfill gap, expected bucket {expected} but found {found:?}")]
    BackfillGap {
        key: StreamKey,
        expected: DateTime<Utc>,
        found: Option<DateTime<Utc>>,
    },

    #[error("{key}: backfill mismatch: {reason}")]
    BackfillMismatch { key: StreamKey, reason: String },

    #[error("backfill: {0}")]
    Backfill(#[from] BackfillError),

    #[error("connect: {0}")]
    Connect(#[from] ConnectError),

    #[error("{key}: reconnect failed: {reason}")]
    ReconnectFailure { key: StreamKey, reason: String },

    #[error("recovery step exceeded the per-attempt timeout")]
    AttemptTimeout,

    #[error("{key}: recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { key: StreamKey, attempts: u32 },

    #[error("{0}: recovery cancelled")]
    RecoveryCancelled(StreamKey),

    #[error("{0}: recovery already active")]
    RecoveryActive(StreamKey),

    #[error("{0}: no active recovery")]
    RecoveryInactive(StreamKey),

    #[error("invalid recovery transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: RecoveryPhase,
        to: RecoveryPhase,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}

impl StreamError {
    /// Determine if a recovery attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::BackfillGap { .. }
            | StreamError::BackfillMismatch { .. }
            | StreamError::ReconnectFailure { .. }
            | StreamError::AttemptTimeout
            | StreamError::Connect(_) => true,
            StreamError::Backfill(error) => error.is_transient(),
            _ => false,
        }
    }
}

/// Errors produced by a [`BackfillSource`](crate::collaborator::BackfillSource).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum BackfillError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl BackfillError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackfillError::Transient(_))
    }
}

/// Errors produced by a [`ConnectionManager`](crate::collaborator::ConnectionManager).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConnectError {
    #[error("invalid stream url: {0}")]
    Url(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    Timeout,

    #[error("connection manager closed")]
    Closed,
}
