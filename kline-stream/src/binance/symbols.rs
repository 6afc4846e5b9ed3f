use serde::Deserialize;
use smol_str::SmolStr;

/// `GET /fapi/v1/exchangeInfo` response, trimmed to the symbol listing.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceExchangeInfo {
    pub symbols: Vec<BinanceSymbolInfo>,
}

/// One `symbols[]` entry of the exchange info.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceSymbolInfo {
    pub symbol: SmolStr,
    pub status: String,
    pub contract_type: String,
    pub quote_asset: String,
}

impl BinanceSymbolInfo {
    /// Currently trading USDT-margined perpetual contract.
    pub fn is_trading_usdt_perpetual(&self) -> bool {
        self.contract_type == "PERPETUAL" && self.status == "TRADING" && self.quote_asset == "USDT"
    }
}

impl BinanceExchangeInfo {
    /// Symbols of every trading USDT-margined perpetual, sorted and deduplicated.
    pub fn usdt_perpetuals(self) -> Vec<SmolStr> {
        let mut symbols = self
            .symbols
            .into_iter()
            .filter(BinanceSymbolInfo::is_trading_usdt_perpetual)
            .map(|info| info.symbol)
            .collect::<Vec<_>>();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}
