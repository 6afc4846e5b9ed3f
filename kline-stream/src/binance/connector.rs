use super::kline::parse_kline_message;
use crate::{
    candle::StreamKey,
    collaborator::{ConnectionManager, FeedMessage},
    error::ConnectError,
    streams::timeout::{DEFAULT_IDLE_TIMEOUT, TimeoutStream},
};
use async_trait::async_trait;
use fnv::FnvHashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_WS_URL: &str = "wss://fstream.binance.com/ws";

/// Binance websocket connector configuration
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Raw stream endpoint, the stream name is appended as a path segment
    pub base_url: String,
    /// A connection that delivers nothing for this long is treated as lost
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_WS_URL.to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// [`ConnectionManager`] holding one websocket per subscribed stream.
///
/// Every connection forwards into the same feed channel, so the receiver sees each stream's
/// frames in socket order.
#[derive(Debug)]
pub struct BinanceConnector {
    config: ConnectorConfig,
    feed: mpsc::Sender<FeedMessage>,
    /// Cancellation handle of each stream's socket task
    tasks: Mutex<FnvHashMap<StreamKey, CancellationToken>>,
}

impl BinanceConnector {
    pub fn new(config: ConnectorConfig, feed: mpsc::Sender<FeedMessage>) -> Self {
        Self {
            config,
            feed,
            tasks: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Construct a connector along with the receiving half of its feed.
    pub fn channel(config: ConnectorConfig, buffer: usize) -> (Self, mpsc::Receiver<FeedMessage>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(config, tx), rx)
    }

    /// `wss://fstream.binance.com/ws/btcusdt@kline_1m`
    pub fn stream_url(&self, key: &StreamKey) -> Result<Url, ConnectError> {
        let raw = format!(
            "{}/{}@kline_{}",
            self.config.base_url.trim_end_matches('/'),
            key.symbol.to_lowercase(),
            key.interval
        );
        Url::parse(&raw).map_err(|error| ConnectError::Url(format!("{raw}: {error}")))
    }

    async fn open(&self, key: &StreamKey) -> Result<(), ConnectError> {
        if self.feed.is_closed() {
            return Err(ConnectError::Closed);
        }

        let url = self.stream_url(key)?;
        let (socket, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectError::Timeout)?
            .map_err(|error| ConnectError::Handshake(error.to_string()))?;
        info!(stream_key = %key, %url, "connected kline stream");

        let cancel = CancellationToken::new();
        tokio::spawn(run_connection(
            key.clone(),
            socket,
            self.feed.clone(),
            cancel.clone(),
            self.config.idle_timeout,
        ));

        let previous = self.tasks.lock().insert(key.clone(), cancel);
        if let Some(previous) = previous {
            previous.cancel();
        }

        Ok(())
    }
}

#[async_trait]
impl ConnectionManager for BinanceConnector {
    async fn subscribe(&self, key: &StreamKey) -> Result<(), ConnectError> {
        self.open(key).await
    }

    async fn unsubscribe(&self, key: &StreamKey) -> Result<(), ConnectError> {
        if let Some(cancel) = self.tasks.lock().remove(key) {
            cancel.cancel();
            debug!(stream_key = %key, "closed kline stream");
        }
        Ok(())
    }

    async fn reconnect(&self, key: &StreamKey) -> Result<(), ConnectError> {
        self.open(key).await?;
        if self.feed.send(FeedMessage::Reconnected(key.clone())).await.is_err() {
            return Err(ConnectError::Closed);
        }
        Ok(())
    }
}

impl Drop for BinanceConnector {
    fn drop(&mut self) {
        for cancel in self.tasks.get_mut().values() {
            cancel.cancel();
        }
    }
}

/// Forward one socket's kline frames into the feed until it ends, errors, idles out or is
/// cancelled. Only an unrequested end is reported as [`FeedMessage::Disconnected`].
async fn run_connection<S>(
    key: StreamKey,
    socket: S,
    feed: mpsc::Sender<FeedMessage>,
    cancel: CancellationToken,
    idle_timeout: Duration,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut stream = TimeoutStream::new(socket, idle_timeout);

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(stream_key = %key, "connection task cancelled");
                return;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => match parse_kline_message(text.as_str()) {
                Ok(Some((event_key, event))) => {
                    if event_key != key {
                        debug!(stream_key = %key, %event_key, "ignoring frame for another stream");
                        continue;
                    }
                    if feed.send(FeedMessage::Event { key: event_key, event }).await.is_err() {
                        warn!(stream_key = %key, "feed receiver dropped, closing connection");
                        return;
                    }
                }
                Ok(None) => {}
                Err(error) => warn!(stream_key = %key, %error, "failed to decode kline frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                info!(stream_key = %key, ?frame, "server closed kline stream");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                warn!(stream_key = %key, %error, "kline stream error");
                break;
            }
            None => {
                if stream.timed_out() {
                    warn!(stream_key = %key, "kline stream went silent");
                }
                break;
            }
        }
    }

    if !cancel.is_cancelled() {
        let _ = feed.send(FeedMessage::Disconnected(key)).await;
    }
}
