use super::{kline::BinanceRestKline, symbols::BinanceExchangeInfo};
use crate::{
    candle::{Candle, StreamKey},
    collaborator::BackfillSource,
    error::BackfillError,
    interval::Interval,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use smol_str::SmolStr;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_REST_URL: &str = "https://fapi.binance.com";
const KLINES_PATH: &str = "/fapi/v1/klines";
const EXCHANGE_INFO_PATH: &str = "/fapi/v1/exchangeInfo";

/// Binance's upper bound on rows per klines request.
pub const MAX_PAGE_LIMIT: u16 = 1_500;

/// [`BackfillSource`] over the Binance futures klines REST endpoint, plus symbol discovery from
/// the exchange info.
#[derive(Debug, Clone)]
pub struct BinanceBackfill {
    client: reqwest::Client,
    klines: Url,
    exchange_info: Url,
    page_limit: u16,
}

impl BinanceBackfill {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackfillError> {
        let endpoint = |path: &str| {
            Url::parse(base_url)
                .and_then(|base| base.join(path))
                .map_err(|error| BackfillError::Permanent(format!("invalid base url: {error}")))
        };
        let klines = endpoint(KLINES_PATH)?;
        let exchange_info = endpoint(EXCHANGE_INFO_PATH)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| BackfillError::Permanent(format!("http client: {error}")))?;

        Ok(Self {
            client,
            klines,
            exchange_info,
            page_limit: MAX_PAGE_LIMIT,
        })
    }

    /// Set rows per request, clamped to `1..=1500`
    pub fn with_page_limit(mut self, limit: u16) -> Self {
        self.page_limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self
    }

    fn page_url(&self, symbol: &str, interval: Interval, start_ms: i64, end_ms: i64) -> Url {
        let mut url = self.klines.clone();
        url.query_pairs_mut()
            .append_pair("symbol", symbol)
            .append_pair("interval", &interval.to_string())
            .append_pair("startTime", &start_ms.to_string())
            .append_pair("endTime", &end_ms.to_string())
            .append_pair("limit", &self.page_limit.to_string());
        url
    }

    /// Symbols of every trading USDT-margined perpetual, sorted.
    pub async fn fetch_symbols(&self) -> Result<Vec<SmolStr>, BackfillError> {
        let info = self
            .get_json::<BinanceExchangeInfo>(self.exchange_info.clone(), "exchange info")
            .await?;
        let listed = info.symbols.len();
        let symbols = info.usdt_perpetuals();

        info!(listed, selected = symbols.len(), "fetched USDT perpetual symbols");
        Ok(symbols)
    }

    async fn get_json<T>(&self, url: Url, what: &str) -> Result<T, BackfillError>
    where
        T: DeserializeOwned,
    {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| BackfillError::Permanent(format!("decode {what}: {error}")))
    }
}

#[async_trait]
impl BackfillSource for BinanceBackfill {
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, BackfillError> {
        let key = StreamKey::new(symbol, interval);
        let end_ms = to.timestamp_millis();
        let mut start_ms = from.timestamp_millis();
        let mut candles = Vec::new();

        while start_ms <= end_ms {
            let url = self.page_url(&key.symbol, interval, start_ms, end_ms);
            let rows = self.get_json::<Vec<BinanceRestKline>>(url, "klines").await?;
            let page_len = rows.len();

            let Some(last_open_ms) = rows.last().map(BinanceRestKline::open_time_ms) else {
                break;
            };
            for row in rows {
                candles.push(
                    row.into_candle(&key)
                        .map_err(|error| BackfillError::Permanent(error.to_string()))?,
                );
            }

            debug!(stream_key = %key, page_len, total = candles.len(), "fetched klines page");
            if page_len < usize::from(self.page_limit) {
                break;
            }
            start_ms = last_open_ms + interval.as_millis();
        }

        Ok(candles)
    }
}

/// Rate limits, IP bans and server errors clear up on their own, other client errors do not.
fn classify_status(status: StatusCode, body: &str) -> BackfillError {
    let message = format!("HTTP {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::IM_A_TEAPOT
        || status.is_server_error()
    {
        BackfillError::Transient(message)
    } else {
        BackfillError::Permanent(message)
    }
}

fn classify_transport(error: reqwest::Error) -> BackfillError {
    if error.is_decode() || error.is_builder() {
        BackfillError::Permanent(error.to_string())
    } else {
        BackfillError::Transient(error.to_string())
    }
}
