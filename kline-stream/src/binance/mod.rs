//! Binance USD-M futures adapters for the collaborator seams.
//!
//! - [`BinanceConnector`]: one websocket per `<symbol>@kline_<interval>` stream, implementing
//!   [`ConnectionManager`](crate::collaborator::ConnectionManager).
//! - [`BinanceBackfill`]: paged `GET /fapi/v1/klines`, implementing
//!   [`BackfillSource`](crate::collaborator::BackfillSource), and USDT perpetual discovery from
//!   `GET /fapi/v1/exchangeInfo`.

pub mod connector;
pub mod kline;
pub mod rest;
pub mod symbols;

pub use connector::{BinanceConnector, ConnectorConfig, DEFAULT_WS_URL};
pub use kline::{BinanceKlineMessage, BinanceRestKline, parse_kline_message};
pub use rest::{BinanceBackfill, DEFAULT_REST_URL};
pub use symbols::{BinanceExchangeInfo, BinanceSymbolInfo};
