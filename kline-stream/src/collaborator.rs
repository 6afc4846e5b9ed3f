//! Seams to the transport and the historical data source.

use crate::{
    candle::{Candle, KlineEvent, StreamKey},
    error::{BackfillError, ConnectError},
    interval::Interval,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Owns the live streaming connections.
///
/// Events are not returned from these calls: they arrive as [`FeedMessage`]s on the channel the
/// implementation was built with, in transport order.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    async fn subscribe(&self, key: &StreamKey) -> Result<(), ConnectError>;

    async fn unsubscribe(&self, key: &StreamKey) -> Result<(), ConnectError>;

    /// Replace the connection for `key`, resolving once the new connection is established.
    async fn reconnect(&self, key: &StreamKey) -> Result<(), ConnectError>;
}

/// Historical candle provider.
#[async_trait]
pub trait BackfillSource: Send + Sync + 'static {
    /// Candles with `from <= open_time <= to`, ordered by `open_time`.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, BackfillError>;
}

/// Message delivered by a [`ConnectionManager`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FeedMessage {
    Event { key: StreamKey, event: KlineEvent },
    Disconnected(StreamKey),
    Reconnected(StreamKey),
}

impl FeedMessage {
    pub fn key(&self) -> &StreamKey {
        match self {
            FeedMessage::Event { key, .. } => key,
            FeedMessage::Disconnected(key) | FeedMessage::Reconnected(key) => key,
        }
    }
}
