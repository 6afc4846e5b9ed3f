//! Engine configuration.
//!
//! Every struct deserialises with `#[serde(default)]`, so a JSON document only needs to carry
//! the fields it overrides. Durations are expressed in milliseconds.

use crate::{error::StreamError, interval::Interval};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-stream state and staleness settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Silence longer than `stale_multiplier × interval` marks a stream STALE
    pub stale_multiplier: f64,
    /// Number of recently closed candles retained per stream
    pub ring_capacity: usize,
    /// Live events held while a stream is suspended for recovery
    pub max_buffered_events: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stale_multiplier: 1.5,
            ring_capacity: 100,
            max_buffered_events: 1_024,
        }
    }
}

impl StreamConfig {
    /// Set stale multiplier
    pub fn with_stale_multiplier(mut self, multiplier: f64) -> Self {
        self.stale_multiplier = multiplier;
        self
    }

    /// Set ring capacity
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    /// Set buffered event bound
    pub fn with_max_buffered_events(mut self, max: usize) -> Self {
        self.max_buffered_events = max;
        self
    }

    /// Staleness threshold for a stream of the given interval, rounded to the millisecond.
    pub fn stale_threshold(&self, interval: Interval) -> TimeDelta {
        let millis = (interval.as_millis() as f64 * self.stale_multiplier).round();
        TimeDelta::milliseconds(millis as i64)
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if !self.stale_multiplier.is_finite() || self.stale_multiplier <= 0.0 {
            return Err(StreamError::InvalidConfig(format!(
                "stale_multiplier must be positive, got {}",
                self.stale_multiplier
            )));
        }
        if self.ring_capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "ring_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_buffered_events == 0 {
            return Err(StreamError::InvalidConfig(
                "max_buffered_events must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry policy of the recovery orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Upper bound of the uniform jitter added to every backoff
    #[serde(with = "duration_ms")]
    pub jitter: Duration,
    /// Bound on each reconnect or backfill step
    #[serde(with = "duration_ms")]
    pub attempt_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RecoveryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.max_attempts == 0 {
            return Err(StreamError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_backoff < self.base_backoff {
            return Err(StreamError::InvalidConfig(format!(
                "max_backoff {:?} is below base_backoff {:?}",
                self.max_backoff, self.base_backoff
            )));
        }
        if self.attempt_timeout.is_zero() {
            return Err(StreamError::InvalidConfig(
                "attempt_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Defaults applied to streams subscribed without their own [`StreamConfig`]
    pub stream: StreamConfig,
    pub recovery: RecoveryConfig,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            recovery: RecoveryConfig::default(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        self.stream.validate()?;
        self.recovery.validate()?;
        if self.sweep_interval.is_zero() {
            return Err(StreamError::InvalidConfig(
                "sweep_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
