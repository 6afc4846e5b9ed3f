//! # Kline Stream
//! Real-time candlestick (kline) state for many `(symbol, interval)` streams at once, with
//! staleness detection and automatic reconnect-and-backfill recovery.
//!
//! ## Overview
//! - [`KlineStore`](store::KlineStore): per-stream open candle plus a bounded ring of closed
//!   candles. Events are bucketed on the epoch grid (weeks open on Monday), duplicates and late
//!   events are rejected and skipped buckets surface as gaps.
//! - [`HealthMonitor`](health::HealthMonitor): HEALTHY / STALE / RECOVERING / FAILED per stream,
//!   derived from the time since the last accepted event.
//! - [`RecoveryOrchestrator`](recovery::orchestrator::RecoveryOrchestrator): drives a stream
//!   through reconnect, backfill and reconcile with bounded exponential backoff.
//! - [`KlineEngine`](engine::KlineEngine): wires the above to a
//!   [`ConnectionManager`](collaborator::ConnectionManager) and a
//!   [`BackfillSource`](collaborator::BackfillSource) and logs per-bucket
//!   [`coverage`] across streams of the same interval.
//! - [`binance`]: Binance USD-M futures implementations of both collaborators.
//!
//! ## Example
//! ```rust,no_run
//! use kline_stream::{
//!     binance::{BinanceBackfill, BinanceConnector, ConnectorConfig, DEFAULT_REST_URL},
//!     candle::StreamKey,
//!     clock::SystemClock,
//!     config::EngineConfig,
//!     engine::KlineEngine,
//!     interval::Interval,
//! };
//! use std::{sync::Arc, time::Duration};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (connector, feed) = BinanceConnector::channel(ConnectorConfig::default(), 1024);
//!     let backfill = BinanceBackfill::new(DEFAULT_REST_URL, Duration::from_secs(10)).unwrap();
//!     let engine = Arc::new(
//!         KlineEngine::new(
//!             EngineConfig::default(),
//!             Arc::new(connector),
//!             Arc::new(backfill),
//!             Arc::new(SystemClock),
//!         )
//!         .unwrap(),
//!     );
//!
//!     let key = StreamKey::new("BTCUSDT", Interval::from_minutes(1));
//!     engine.subscribe(key.clone(), None).await.unwrap();
//!     engine.bootstrap(&key).await.unwrap();
//!
//!     tokio::spawn(engine.clone().run_monitor(CancellationToken::new()));
//!     tokio::spawn(engine.clone().run_feed(feed));
//!
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     println!("{:?}", engine.get_current_candle(&key));
//! }
//! ```

/// Binance USD-M futures connector and REST backfill.
pub mod binance;

/// Epoch-aligned time buckets.
pub mod bucket;

/// [`StreamKey`](candle::StreamKey), [`Candle`](candle::Candle) and
/// [`KlineEvent`](candle::KlineEvent) data model.
pub mod candle;

/// Injectable time source.
pub mod clock;

/// Transport and historical data seams.
pub mod collaborator;

/// Tunables for stores, health and recovery.
pub mod config;

/// Which streams of an interval updated each bucket.
pub mod coverage;

pub mod engine;

/// All [`Error`](std::error::Error)s generated in Kline Stream.
pub mod error;

pub mod health;

/// Candle [`Interval`](interval::Interval) parsing and arithmetic.
pub mod interval;

pub mod recovery;

pub mod store;

/// Stream utilities.
pub mod streams;

pub use candle::{Candle, KlineEvent, StreamKey};
pub use engine::KlineEngine;
pub use error::StreamError;
pub use interval::Interval;
