use chrono::Utc;
use futures::StreamExt;
use kline_stream::{
    Interval, KlineEngine, StreamError, StreamKey,
    binance::{
        BinanceBackfill, BinanceConnector, ConnectorConfig, DEFAULT_REST_URL, DEFAULT_WS_URL,
    },
    clock::SystemClock,
    config::EngineConfig,
    health::HealthStatus,
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type Engine = KlineEngine<BinanceConnector, BinanceBackfill, SystemClock>;

const DEFAULT_STREAMS: &str = "BTCUSDT@1m,ETHUSDT@1m";

/// Streams subscribed and bootstrapped at the same time during start-up.
const INITIAL_LOAD_CONCURRENCY: usize = 5;

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    info!("Starting kline stream monitor");

    // Streams to track, configurable via KLINE_STREAMS (default: BTCUSDT@1m,ETHUSDT@1m).
    // KLINE_STREAMS=ALL tracks every trading USDT perpetual at KLINE_INTERVAL (default: 1m).
    let raw_streams =
        std::env::var("KLINE_STREAMS").unwrap_or_else(|_| DEFAULT_STREAMS.to_string());

    // Engine tunables, optionally overridden by a JSON file at KLINE_CONFIG
    let config = match load_config() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid KLINE_CONFIG");
            return;
        }
    };

    let ws_url = std::env::var("BINANCE_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());
    let rest_url =
        std::env::var("BINANCE_REST_URL").unwrap_or_else(|_| DEFAULT_REST_URL.to_string());
    let health_log_period = std::env::var("HEALTH_LOG_SECS")
        .ok()
        .and_then(|secs| secs.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(30));

    let (connector, feed) = BinanceConnector::channel(ConnectorConfig::new(ws_url), 10_000);
    let backfill = match BinanceBackfill::new(&rest_url, Duration::from_secs(10)) {
        Ok(backfill) => Arc::new(backfill),
        Err(error) => {
            error!(%error, %rest_url, "failed to build REST client");
            return;
        }
    };

    let keys = match stream_keys(&raw_streams, &backfill).await {
        Ok(keys) => keys,
        Err(error) => {
            error!(%error, streams = %raw_streams, "failed to resolve KLINE_STREAMS");
            return;
        }
    };

    let engine = match KlineEngine::new(
        config,
        Arc::new(connector),
        backfill,
        Arc::new(SystemClock),
    ) {
        Ok(engine) => Arc::new(engine),
        Err(error) => {
            error!(%error, "invalid engine configuration");
            return;
        }
    };

    // Start consuming before subscribing so early frames are not left waiting in the channel
    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&engine).run_feed(feed));

    let loaded = futures::stream::iter(keys)
        .map(|key| load_stream(&engine, key))
        .buffer_unordered(INITIAL_LOAD_CONCURRENCY)
        .filter(|loaded| futures::future::ready(*loaded))
        .count()
        .await;
    info!(loaded, "initial load complete");

    tokio::spawn(Arc::clone(&engine).run_monitor(cancel.clone()));
    tokio::spawn(log_health(Arc::clone(&engine), health_log_period, cancel.clone()));

    info!(streams = ?engine.stream_keys(), "kline stream monitor running");

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
    }

    info!("Shutting down");
    cancel.cancel();
    for key in engine.stream_keys() {
        if let Err(error) = engine.unsubscribe(&key).await {
            warn!(stream_key = %key, %error, "failed to unsubscribe");
        }
    }
}

/// Resolve KLINE_STREAMS into stream keys, listing the exchange's symbols for `ALL`.
async fn stream_keys(
    raw: &str,
    backfill: &BinanceBackfill,
) -> Result<Vec<StreamKey>, StreamError> {
    if !raw.trim().eq_ignore_ascii_case("ALL") {
        return parse_stream_keys(raw);
    }

    let raw_interval = std::env::var("KLINE_INTERVAL").unwrap_or_else(|_| "1m".to_string());
    let interval = Interval::from_str(&raw_interval)?;
    let symbols = backfill.fetch_symbols().await?;

    Ok(symbols
        .into_iter()
        .map(|symbol| StreamKey::new(symbol, interval))
        .collect())
}

/// Subscribe one stream and load its closed history. Returns whether the history was loaded.
async fn load_stream(engine: &Arc<Engine>, key: StreamKey) -> bool {
    if let Err(error) = engine.subscribe(key.clone(), None).await {
        error!(stream_key = %key, %error, "failed to subscribe");
        return false;
    }

    match engine.bootstrap(&key).await {
        Ok(_) => true,
        Err(error) => {
            warn!(stream_key = %key, %error, "bootstrap failed, history will fill from the live feed");
            false
        }
    }
}

/// Parse a comma separated list of `SYMBOL@interval` stream names.
fn parse_stream_keys(raw: &str) -> Result<Vec<StreamKey>, StreamError> {
    raw.split(',')
        .map(str::trim)
        .filter(|stream| !stream.is_empty())
        .map(|stream| {
            let (symbol, interval) = stream.split_once('@').ok_or_else(|| {
                StreamError::InvalidConfig(format!("stream '{stream}' is not SYMBOL@interval"))
            })?;
            Ok(StreamKey::new(symbol, Interval::from_str(interval)?))
        })
        .collect()
}

fn load_config() -> Result<EngineConfig, StreamError> {
    let Ok(path) = std::env::var("KLINE_CONFIG") else {
        return Ok(EngineConfig::default());
    };

    let raw = std::fs::read_to_string(&path)
        .map_err(|error| StreamError::InvalidConfig(format!("{path}: {error}")))?;
    let config = serde_json::from_str::<EngineConfig>(&raw)
        .map_err(|error| StreamError::InvalidConfig(format!("{path}: {error}")))?;

    info!(%path, ?config, "loaded engine configuration");
    Ok(config)
}

/// Periodically log one structured line per stream with its health and recovery state.
async fn log_health(engine: Arc<Engine>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Utc::now();
        for record in engine.health_snapshot() {
            let key = &record.stream_key;
            let current = engine.get_current_candle(key).ok().flatten();
            let closed_candles = engine
                .get_recent_closed(key, usize::MAX)
                .map_or(0, |closed| closed.len());
            let summary = serde_json::json!({
                "stream": key.to_string(),
                "status": record.status,
                "silence_ms": record.silence(now).num_milliseconds(),
                "recovery_phase": engine.recovery_phase(key).ok(),
                "open_time": current.as_ref().map(|candle| candle.open_time),
                "close": current.as_ref().map(|candle| candle.close),
                "closed_candles": closed_candles,
            });

            match record.status {
                HealthStatus::Healthy => info!(%summary, "stream health"),
                HealthStatus::Stale | HealthStatus::Recovering => warn!(%summary, "stream health"),
                HealthStatus::Failed => {
                    let failure = engine.recovery_failure(key).map(|failure| failure.to_string());
                    error!(%summary, ?failure, "stream health")
                }
            }
        }
    }
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
