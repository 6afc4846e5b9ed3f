//! Reconnect-and-backfill recovery.
//!
//! Each stream in recovery is driven through an explicit phase machine:
//!
//! ```text
//! Idle -> DetectingStale -> Reconnecting -> Backfilling -> Reconciling -> Idle
//!                           ^----------'    ^---------'    |
//!                                           ^--------------'   (validation failed)
//! Idle -> Backfilling                                           (bootstrap)
//! any active phase -> Failed
//! ```

use crate::{candle::StreamKey, config::RecoveryConfig, error::StreamError};
use chrono::{DateTime, Utc};
use derive_more::Display;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod orchestrator;
pub mod reconcile;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Deserialize, Serialize)]
pub enum RecoveryPhase {
    Idle,
    DetectingStale,
    Reconnecting,
    Backfilling,
    Reconciling,
    Failed,
}

impl RecoveryPhase {
    pub fn can_transition(self, to: RecoveryPhase) -> bool {
        use RecoveryPhase::*;
        matches!(
            (self, to),
            (Idle, DetectingStale)
                | (Idle, Backfilling)
                | (DetectingStale, Reconnecting)
                | (Reconnecting, Reconnecting)
                | (Reconnecting, Backfilling)
                | (Backfilling, Backfilling)
                | (Backfilling, Reconciling)
                | (Reconciling, Idle)
                | (Reconciling, Backfilling)
                | (DetectingStale | Reconnecting | Backfilling | Reconciling, Failed)
                | (Failed, Idle)
        )
    }

    pub fn is_active(self) -> bool {
        !matches!(self, RecoveryPhase::Idle | RecoveryPhase::Failed)
    }
}

/// What caused a stream to enter recovery.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum RecoveryTrigger {
    Stale,
    Disconnected,
    ConsistencyViolation,
    /// Operator retry after a terminal failure
    Manual,
    /// Initial history load of an empty ring
    Bootstrap,
}

/// Requested backfill window, `from` inclusive.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct BackfillRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecoverySession {
    pub stream_key: StreamKey,
    pub started_at: DateTime<Utc>,
    pub trigger: RecoveryTrigger,
    pub phase: RecoveryPhase,
    pub last_known_closed_open_time: Option<DateTime<Utc>>,
    pub backfill_range: Option<BackfillRange>,
    pub attempts: u32,
    pub last_error: Option<StreamError>,
}

impl RecoverySession {
    pub fn new(stream_key: StreamKey, trigger: RecoveryTrigger, started_at: DateTime<Utc>) -> Self {
        Self {
            stream_key,
            started_at,
            trigger,
            phase: RecoveryPhase::Idle,
            last_known_closed_open_time: None,
            backfill_range: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn advance(&mut self, to: RecoveryPhase) -> Result<(), StreamError> {
        if !self.phase.can_transition(to) {
            return Err(StreamError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }
}

/// Delay before retry number `attempt` (1-based): `min(base × 2^(attempt-1), max)` plus uniform
/// jitter in `[0, jitter]`.
pub fn backoff_delay(config: &RecoveryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let backoff = config
        .base_backoff
        .saturating_mul(1_u32 << exponent)
        .min(config.max_backoff);

    let jitter_ms = u64::try_from(config.jitter.as_millis()).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return backoff;
    }

    backoff + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}
