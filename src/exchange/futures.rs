// =============================================================================
// USDT-M futures REST client — leverage-aware account and order access
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ExchangeConfig, FuturesConfig};
use crate::data::models::{Candle, Ticker};
use crate::exchange::spot::{normalize_order, parse_klines};
use crate::exchange::{
    from_native, is_auth_error, is_transient, parse_filters, round_step, round_tick,
    signed_query, str_f64_or_zero, to_native, SymbolFilters, READ_RETRIES, RETRY_BASE_SECS,
};
use crate::types::{PositionSide, TradingMode};

/// Simulated wallet for paper mode without a testnet key.
const PAPER_WALLET_BALANCE: f64 = 10_000.0;

/// Futures margin-account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesBalance {
    pub total_wallet_balance: f64,
    pub available_balance: f64,
    pub total_unrealized_pnl: f64,
    pub total_margin_balance: f64,
}

/// One exchange-reported position (non-zero amount only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub contracts: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub liquidation_price: f64,
    pub leverage: u32,
    pub margin_type: String,
}

pub struct FuturesClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    leverage: u32,
    margin_type: String,
    /// Paper mode without testnet keys never touches the wire for account data.
    simulated: bool,
    filters: RwLock<HashMap<String, SymbolFilters>>,
    /// Symbols whose leverage/margin-type have been pushed this session.
    configured: RwLock<std::collections::HashSet<String>>,
}

impl FuturesClient {
    pub fn new(config: &ExchangeConfig, fc: &FuturesConfig) -> Self {
        let use_testnet = config.testnet && !config.futures_api_key.is_empty();
        let (api_key, secret, base_url) = if use_testnet {
            (
                config.futures_api_key.clone(),
                config.futures_api_secret.clone(),
                "https://testnet.binancefuture.com".to_string(),
            )
        } else {
            (
                config.api_key.clone(),
                config.api_secret.clone(),
                "https://fapi.binance.com".to_string(),
            )
        };

        let simulated = fc.mode == TradingMode::Paper && !use_testnet;

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, simulated, "FuturesClient initialised");

        Self {
            secret,
            base_url,
            client,
            leverage: fc.leverage,
            margin_type: fc.margin_type.to_uppercase(),
            simulated,
            filters: RwLock::new(HashMap::new()),
            configured: RwLock::new(std::collections::HashSet::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn get_with_retry(&self, url: &str, what: &str) -> Result<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            let result = self.get_once(url, what).await;
            match &result {
                Err(e) if attempt < READ_RETRIES && format!("{e:#}").contains("(transient)") => {
                    let delay = RETRY_BASE_SECS * 2u64.pow(attempt);
                    warn!(what, attempt, delay_s = delay, "transient exchange error — retrying");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                _ => return result,
            }
        }
    }

    async fn get_once(&self, url: &str, what: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {what} request failed (transient)"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;
        if !status.is_success() {
            if is_auth_error(status, &body) {
                anyhow::bail!("{what} auth failure {status}: {body}");
            }
            if is_transient(status) {
                anyhow::bail!("{what} returned {status}: {body} (transient)");
            }
            anyhow::bail!("{what} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
        what: &str,
    ) -> Result<serde_json::Value> {
        let qs = signed_query(&self.secret, params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;
        if !status.is_success() {
            anyhow::bail!("{what} returned {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Leverage / margin setup
    // -------------------------------------------------------------------------

    /// Push the configured leverage and margin type for a symbol, once per
    /// session. Margin-type "no need to change" errors are ignored.
    pub async fn ensure_leverage_and_margin(&self, symbol: &str) -> Result<()> {
        if self.simulated || self.configured.read().contains(symbol) {
            return Ok(());
        }
        self.set_margin_type(symbol, &self.margin_type).await?;
        self.set_leverage(symbol, self.leverage).await?;
        self.configured.write().insert(symbol.to_string());
        Ok(())
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let native = to_native(symbol);
        let params = format!("symbol={native}&leverage={leverage}");
        self.send_signed(
            reqwest::Method::POST,
            "/fapi/v1/leverage",
            &params,
            "POST /fapi/v1/leverage",
        )
        .await?;
        info!(symbol, leverage, "leverage set");
        Ok(())
    }

    pub async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<()> {
        let native = to_native(symbol);
        let mt = if margin_type.eq_ignore_ascii_case("cross") { "CROSSED" } else { "ISOLATED" };
        let params = format!("symbol={native}&marginType={mt}");
        match self
            .send_signed(
                reqwest::Method::POST,
                "/fapi/v1/marginType",
                &params,
                "POST /fapi/v1/marginType",
            )
            .await
        {
            Ok(_) => Ok(()),
            // -4046: margin type already what we asked for.
            Err(e) if format!("{e:#}").contains("-4046") => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let native = to_native(symbol);
        let url = format!("{}/fapi/v1/ticker/bookTicker?symbol={native}", self.base_url);
        let body = self.get_with_retry(&url, "GET /fapi/v1/ticker/bookTicker").await?;

        let bid = str_f64_or_zero(&body["bidPrice"]);
        let ask = str_f64_or_zero(&body["askPrice"]);
        let last = if bid > 0.0 && ask > 0.0 { (bid + ask) / 2.0 } else { bid.max(ask) };
        Ok(Ticker {
            symbol: symbol.to_string(),
            bid,
            ask,
            last,
            timestamp: super::timestamp_ms() as i64,
        })
    }

    pub async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let native = to_native(symbol);
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={native}&interval={timeframe}&limit={limit}",
            self.base_url
        );
        if let Some(start) = since {
            url.push_str(&format!("&startTime={start}"));
        }
        let body = self.get_with_retry(&url, "GET /fapi/v1/klines").await?;
        parse_klines(&body)
    }

    /// GET /fapi/v1/premiumIndex → last funding rate for a symbol.
    pub async fn get_funding_rate(&self, symbol: &str) -> Result<f64> {
        let native = to_native(symbol);
        let url = format!("{}/fapi/v1/premiumIndex?symbol={native}", self.base_url);
        let body = self.get_with_retry(&url, "GET /fapi/v1/premiumIndex").await?;
        Ok(str_f64_or_zero(&body["lastFundingRate"]))
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    pub async fn get_futures_balance(&self) -> Result<FuturesBalance> {
        if self.simulated {
            return Ok(FuturesBalance {
                total_wallet_balance: PAPER_WALLET_BALANCE,
                available_balance: PAPER_WALLET_BALANCE,
                total_unrealized_pnl: 0.0,
                total_margin_balance: PAPER_WALLET_BALANCE,
            });
        }
        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v2/account", "", "GET /fapi/v2/account")
            .await?;
        Ok(FuturesBalance {
            total_wallet_balance: str_f64_or_zero(&body["totalWalletBalance"]),
            available_balance: str_f64_or_zero(&body["availableBalance"]),
            total_unrealized_pnl: str_f64_or_zero(&body["totalUnrealizedProfit"]),
            total_margin_balance: str_f64_or_zero(&body["totalMarginBalance"]),
        })
    }

    /// Account margin ratio = maintenance margin / margin balance.
    pub async fn get_margin_ratio(&self) -> Result<f64> {
        if self.simulated {
            return Ok(0.0);
        }
        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v2/account", "", "GET /fapi/v2/account")
            .await?;
        let margin_balance = str_f64_or_zero(&body["totalMarginBalance"]);
        if margin_balance <= 0.0 {
            return Ok(0.0);
        }
        let maintenance = str_f64_or_zero(&body["totalMaintMargin"]);
        Ok(maintenance / margin_balance)
    }

    /// GET /fapi/v2/positionRisk → open positions (non-zero amounts only).
    pub async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        if self.simulated {
            return Ok(Vec::new());
        }
        let body = self
            .send_signed(
                reqwest::Method::GET,
                "/fapi/v2/positionRisk",
                "",
                "GET /fapi/v2/positionRisk",
            )
            .await?;
        let raw = body.as_array().context("positionRisk response is not an array")?;

        let mut out = Vec::new();
        for pos in raw {
            let amt = str_f64_or_zero(&pos["positionAmt"]);
            if amt == 0.0 {
                continue;
            }
            let native = pos["symbol"].as_str().unwrap_or("");
            out.push(ExchangePosition {
                symbol: from_native(native),
                side: if amt > 0.0 { PositionSide::Long } else { PositionSide::Short },
                contracts: amt.abs(),
                entry_price: str_f64_or_zero(&pos["entryPrice"]),
                mark_price: str_f64_or_zero(&pos["markPrice"]),
                unrealized_pnl: str_f64_or_zero(&pos["unRealizedProfit"]),
                liquidation_price: str_f64_or_zero(&pos["liquidationPrice"]),
                leverage: str_f64_or_zero(&pos["leverage"]) as u32,
                margin_type: pos["marginType"].as_str().unwrap_or("cross").to_string(),
            });
        }
        debug!(count = out.len(), "futures positions fetched");
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Filters
    // -------------------------------------------------------------------------

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        if let Some(f) = self.filters.read().get(symbol) {
            return Ok(*f);
        }
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let body = self.get_with_retry(&url, "GET /fapi/v1/exchangeInfo").await?;
        let native = to_native(symbol);
        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(native.as_str())))
            .context("symbol not found in futures exchangeInfo")?;
        let f = parse_filters(info);
        self.filters.write().insert(symbol.to_string(), f);
        Ok(f)
    }

    pub async fn get_min_order_amount(&self, symbol: &str) -> Result<f64> {
        Ok(self.symbol_filters(symbol).await?.min_qty)
    }

    pub async fn get_min_notional(&self, symbol: &str) -> Result<f64> {
        Ok(self.symbol_filters(symbol).await?.min_notional)
    }

    pub async fn round_quantity(&self, symbol: &str, qty: f64) -> Result<f64> {
        let f = self.symbol_filters(symbol).await?;
        Ok(round_step(qty, f.step_size))
    }

    async fn round_price(&self, symbol: &str, price: f64) -> Result<f64> {
        let f = self.symbol_filters(symbol).await?;
        Ok(round_tick(price, f.tick_size))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order MARKET. With `reduce_only`, the order can only
    /// shrink an existing position; the exchange rejects it otherwise.
    ///
    /// Testnet occasionally reports `executedQty = 0` on an immediately-filled
    /// market order; in that case the order is re-queried once.
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<serde_json::Value> {
        let qty = self.round_quantity(symbol, quantity).await?;
        let native = to_native(symbol);
        let mut params = format!(
            "symbol={native}&side={}&type=MARKET&quantity={qty}",
            side.to_uppercase()
        );
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }

        info!(symbol, side, qty, reduce_only, "placing futures market order");
        let body = self
            .send_signed(reqwest::Method::POST, "/fapi/v1/order", &params, "POST /fapi/v1/order")
            .await?;

        let mut order = normalize_order(&body, symbol);
        if order["filled"].as_f64().unwrap_or(0.0) == 0.0 {
            if let Some(id) = body["orderId"].as_i64() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if let Ok(refreshed) = self.get_order_status(&id.to_string(), symbol).await {
                    if refreshed["filled"].as_f64().unwrap_or(0.0) > 0.0 {
                        debug!(order_id = id, "order re-query resolved zero executedQty");
                        order = refreshed;
                    }
                }
            }
        }
        Ok(order)
    }

    /// Reduce-only STOP_MARKET at `stop_price` (protective stop-loss).
    pub async fn place_stop_market(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: f64,
    ) -> Result<serde_json::Value> {
        let qty = self.round_quantity(symbol, quantity).await?;
        let stop = self.round_price(symbol, stop_price).await?;
        let native = to_native(symbol);
        let params = format!(
            "symbol={native}&side={}&type=STOP_MARKET&quantity={qty}&stopPrice={stop}&reduceOnly=true",
            side.to_uppercase()
        );
        let body = self
            .send_signed(
                reqwest::Method::POST,
                "/fapi/v1/order",
                &params,
                "POST /fapi/v1/order STOP_MARKET",
            )
            .await?;
        Ok(normalize_order(&body, symbol))
    }

    /// Reduce-only TAKE_PROFIT_MARKET at `stop_price`.
    pub async fn place_take_profit_market(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: f64,
    ) -> Result<serde_json::Value> {
        let qty = self.round_quantity(symbol, quantity).await?;
        let stop = self.round_price(symbol, stop_price).await?;
        let native = to_native(symbol);
        let params = format!(
            "symbol={native}&side={}&type=TAKE_PROFIT_MARKET&quantity={qty}&stopPrice={stop}&reduceOnly=true",
            side.to_uppercase()
        );
        let body = self
            .send_signed(
                reqwest::Method::POST,
                "/fapi/v1/order",
                &params,
                "POST /fapi/v1/order TAKE_PROFIT_MARKET",
            )
            .await?;
        Ok(normalize_order(&body, symbol))
    }

    pub async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()> {
        let native = to_native(symbol);
        let params = format!("symbol={native}&orderId={order_id}");
        match self
            .send_signed(
                reqwest::Method::DELETE,
                "/fapi/v1/order",
                &params,
                "DELETE /fapi/v1/order",
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if format!("{e:#}").contains("-2011") => {
                debug!(order_id, "cancel skipped: order unknown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_order_status(&self, order_id: &str, symbol: &str) -> Result<serde_json::Value> {
        let native = to_native(symbol);
        let params = format!("symbol={native}&orderId={order_id}");
        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v1/order", &params, "GET /fapi/v1/order")
            .await?;
        let mut order = normalize_order(&body, symbol);
        // Futures fills report avgPrice rather than cummulativeQuoteQty.
        let avg = str_f64_or_zero(&body["avgPrice"]);
        if avg > 0.0 {
            order["price"] = serde_json::json!(avg);
        }
        Ok(order)
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("simulated", &self.simulated)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> (ExchangeConfig, FuturesConfig) {
        let ex = ExchangeConfig {
            api_key: "k".into(),
            api_secret: "s".into(),
            testnet: false,
            testnet_api_key: String::new(),
            testnet_api_secret: String::new(),
            futures_api_key: String::new(),
            futures_api_secret: String::new(),
        };
        let fc: FuturesConfig = serde_yaml::from_str("{}").unwrap();
        (ex, fc)
    }

    #[tokio::test]
    async fn paper_mode_simulates_account() {
        let (ex, fc) = test_config();
        let client = FuturesClient::new(&ex, &fc);
        assert!(client.simulated);

        let bal = client.get_futures_balance().await.unwrap();
        assert!((bal.available_balance - PAPER_WALLET_BALANCE).abs() < f64::EPSILON);
        assert!((client.get_margin_ratio().await.unwrap()).abs() < f64::EPSILON);
        assert!(client.get_positions().await.unwrap().is_empty());
    }

    #[test]
    fn margin_type_uppercased() {
        let (ex, mut fc) = test_config();
        fc.margin_type = "cross".into();
        let client = FuturesClient::new(&ex, &fc);
        assert_eq!(client.margin_type, "CROSS");
    }
}
