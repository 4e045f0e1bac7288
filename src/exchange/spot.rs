// =============================================================================
// Spot REST client — market data, account, orders, OCO, loans, earn
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::data::models::{AggTrade, Candle, Ticker};
use crate::exchange::{
    is_auth_error, is_transient, parse_filters, parse_str_f64, round_step, round_tick,
    signed_query, str_f64_or_zero, to_native, SymbolFilters, READ_RETRIES, RETRY_BASE_SECS,
};

pub struct SpotClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// Per-symbol trading filters, lazily loaded from exchangeInfo.
    filters: RwLock<HashMap<String, SymbolFilters>>,
}

impl SpotClient {
    /// Build a spot client. With `testnet` credentials present and
    /// `force_production` false, orders go to testnet.binance.vision;
    /// balances and loans always need production keys, so callers that need
    /// real account data pass `force_production = true`.
    pub fn new(config: &ExchangeConfig, force_production: bool) -> Self {
        let use_testnet =
            config.testnet && !force_production && !config.testnet_api_key.is_empty();
        let (api_key, secret, base_url) = if use_testnet {
            (
                config.testnet_api_key.clone(),
                config.testnet_api_secret.clone(),
                "https://testnet.binance.vision".to_string(),
            )
        } else {
            (
                config.api_key.clone(),
                config.api_secret.clone(),
                "https://api.binance.com".to_string(),
            )
        };

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "SpotClient initialised");

        Self {
            secret,
            base_url,
            client,
            filters: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// GET with exponential back-off on transient failures. Auth errors are
    /// surfaced immediately.
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
    // Market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/ticker/bookTicker + price (public).
    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let native = to_native(symbol);
        let url = format!("{}/api/v3/ticker/bookTicker?symbol={native}", self.base_url);
        let body = self.get_with_retry(&url, "GET /api/v3/ticker/bookTicker").await?;

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

    /// GET /api/v3/klines (public). `since` is an optional start time in ms.
    pub async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let native = to_native(symbol);
        let mut url = format!(
            "{}/api/v3/klines?symbol={native}&interval={timeframe}&limit={limit}",
            self.base_url
        );
        if let Some(start) = since {
            url.push_str(&format!("&startTime={start}"));
        }
        let body = self.get_with_retry(&url, "GET /api/v3/klines").await?;
        parse_klines(&body)
    }

    /// GET /api/v3/aggTrades (public). Returns trades oldest-first.
    pub async fn fetch_agg_trades(&self, symbol: &str, limit: u32) -> Result<Vec<AggTrade>> {
        let native = to_native(symbol);
        let url = format!(
            "{}/api/v3/aggTrades?symbol={native}&limit={limit}",
            self.base_url
        );
        let body = self.get_with_retry(&url, "GET /api/v3/aggTrades").await?;
        let raw = body.as_array().context("aggTrades response is not an array")?;

        let mut trades = Vec::with_capacity(raw.len());
        for t in raw {
            trades.push(AggTrade {
                trade_id: t["a"].as_i64().unwrap_or(0),
                price: str_f64_or_zero(&t["p"]),
                quantity: str_f64_or_zero(&t["q"]),
                timestamp: t["T"].as_i64().unwrap_or(0),
                is_buyer_maker: t["m"].as_bool().unwrap_or(false),
            });
        }
        debug!(symbol, count = trades.len(), "aggTrades fetched");
        Ok(trades)
    }

    // -------------------------------------------------------------------------
    // Filters
    // -------------------------------------------------------------------------

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        if let Some(f) = self.filters.read().get(symbol) {
            return Ok(*f);
        }
        let native = to_native(symbol);
        let url = format!("{}/api/v3/exchangeInfo?symbol={native}", self.base_url);
        let body = self.get_with_retry(&url, "GET /api/v3/exchangeInfo").await?;
        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("symbol not found in exchangeInfo response")?;
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
    // Account
    // -------------------------------------------------------------------------

    /// GET /api/v3/account (signed) → currency → free balance, non-zero only.
    pub async fn get_balance(&self) -> Result<HashMap<String, f64>> {
        let body = self
            .send_signed(reqwest::Method::GET, "/api/v3/account", "", "GET /api/v3/account")
            .await?;
        let balances = body["balances"]
            .as_array()
            .context("account response missing 'balances' array")?;

        let mut out = HashMap::new();
        for b in balances {
            let asset = b["asset"].as_str().unwrap_or("").to_string();
            let free = str_f64_or_zero(&b["free"]);
            if free > 0.0 && !asset.is_empty() {
                out.insert(asset, free);
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /api/v3/order MARKET (signed). Returns the normalised order.
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
    ) -> Result<serde_json::Value> {
        let qty = self.round_quantity(symbol, quantity).await?;
        let native = to_native(symbol);
        let params = format!("symbol={native}&side={}&type=MARKET&quantity={qty}", side.to_uppercase());

        info!(symbol, side, qty, "placing spot market order");
        let body = self
            .send_signed(reqwest::Method::POST, "/api/v3/order", &params, "POST /api/v3/order")
            .await?;
        Ok(normalize_order(&body, symbol))
    }

    /// Place an OCO sell: limit-maker take-profit above, stop-loss-limit below.
    /// Returns `{oco_id, tp_order_id, sl_order_id, ...}`.
    pub async fn place_oco_sell(
        &self,
        symbol: &str,
        quantity: f64,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<serde_json::Value> {
        let qty = self.round_quantity(symbol, quantity).await?;
        let tp = self.round_price(symbol, take_profit_price).await?;
        let sl = self.round_price(symbol, stop_loss_price).await?;
        // Stop-limit slightly below the trigger so the limit leg actually fills.
        let sl_limit = self.round_price(symbol, stop_loss_price * 0.998).await?;
        let native = to_native(symbol);

        let params = format!(
            "symbol={native}&side=SELL&quantity={qty}\
             &aboveType=LIMIT_MAKER&abovePrice={tp}\
             &belowType=STOP_LOSS_LIMIT&belowPrice={sl_limit}&belowStopPrice={sl}\
             &belowTimeInForce=GTC"
        );

        info!(symbol, qty, tp, sl, "placing OCO sell");
        let body = self
            .send_signed(
                reqwest::Method::POST,
                "/api/v3/orderList/oco",
                &params,
                "POST /api/v3/orderList/oco",
            )
            .await?;

        let mut tp_id: Option<String> = None;
        let mut sl_id: Option<String> = None;
        if let Some(reports) = body["orderReports"].as_array() {
            for o in reports {
                let otype = o["type"].as_str().unwrap_or("").to_uppercase();
                let id = o["orderId"].as_i64().map(|v| v.to_string());
                match otype.as_str() {
                    "LIMIT_MAKER" | "LIMIT" => tp_id = id,
                    "STOP_LOSS_LIMIT" | "STOP_LOSS" => sl_id = id,
                    _ => {}
                }
            }
        }
        if tp_id.is_none() && sl_id.is_none() {
            tp_id = body["orderListId"].as_i64().map(|v| v.to_string());
        }

        info!(tp_id = ?tp_id, sl_id = ?sl_id, "OCO sell placed");
        Ok(serde_json::json!({
            "oco_id": body["orderListId"],
            "tp_order_id": tp_id,
            "sl_order_id": sl_id,
            "symbol": symbol,
            "amount": qty,
            "take_profit_price": tp,
            "stop_loss_price": sl,
        }))
    }

    /// DELETE /api/v3/order (signed). Not-found errors are swallowed.
    pub async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()> {
        let native = to_native(symbol);
        let params = format!("symbol={native}&orderId={order_id}");
        match self
            .send_signed(reqwest::Method::DELETE, "/api/v3/order", &params, "DELETE /api/v3/order")
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if format!("{e:#}").contains("-2011") => {
                // Unknown order — already filled or cancelled.
                debug!(order_id, "cancel skipped: order unknown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// GET /api/v3/order (signed) — normalised status.
    pub async fn get_order_status(&self, order_id: &str, symbol: &str) -> Result<serde_json::Value> {
        let native = to_native(symbol);
        let params = format!("symbol={native}&orderId={order_id}");
        let body = self
            .send_signed(reqwest::Method::GET, "/api/v3/order", &params, "GET /api/v3/order")
            .await?;
        Ok(normalize_order(&body, symbol))
    }

    // -------------------------------------------------------------------------
    // Flexible loans
    // -------------------------------------------------------------------------

    /// GET /sapi/v2/loan/flexible/ongoing/orders (signed).
    pub async fn fetch_loan_ongoing_orders(&self, limit: u32) -> Result<Vec<serde_json::Value>> {
        let params = format!("limit={limit}");
        let body = self
            .send_signed(
                reqwest::Method::GET,
                "/sapi/v2/loan/flexible/ongoing/orders",
                &params,
                "GET loan ongoing orders",
            )
            .await?;
        Ok(body["rows"].as_array().cloned().unwrap_or_default())
    }

    /// POST /sapi/v2/loan/flexible/adjust/ltv (signed).
    pub async fn loan_adjust_ltv(
        &self,
        loan_coin: &str,
        collateral_coin: &str,
        adjustment_amount: f64,
        direction_additional: bool,
    ) -> Result<serde_json::Value> {
        let direction = if direction_additional { "ADDITIONAL" } else { "REDUCED" };
        let params = format!(
            "loanCoin={loan_coin}&collateralCoin={collateral_coin}\
             &adjustmentAmount={adjustment_amount}&direction={direction}"
        );
        self.send_signed(
            reqwest::Method::POST,
            "/sapi/v2/loan/flexible/adjust/ltv",
            &params,
            "POST loan adjust ltv",
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Flexible earn
    // -------------------------------------------------------------------------

    /// Redeem every flexible-earn USDT position; returns the redeemed amount.
    pub async fn redeem_all_usdt_earn(&self) -> Result<f64> {
        let body = self
            .send_signed(
                reqwest::Method::GET,
                "/sapi/v1/simple-earn/flexible/position",
                "asset=USDT",
                "GET earn flexible position",
            )
            .await?;
        let rows = body["rows"].as_array().cloned().unwrap_or_default();

        let mut redeemed = 0.0;
        for row in rows {
            let product_id = row["productId"].as_str().unwrap_or("");
            let amount = str_f64_or_zero(&row["totalAmount"]);
            if product_id.is_empty() || amount <= 0.0 {
                continue;
            }
            let params = format!("productId={product_id}&redeemAll=true");
            match self
                .send_signed(
                    reqwest::Method::POST,
                    "/sapi/v1/simple-earn/flexible/redeem",
                    &params,
                    "POST earn flexible redeem",
                )
                .await
            {
                Ok(_) => {
                    redeemed += amount;
                    info!(product_id, amount, "flexible earn USDT redeemed");
                }
                Err(e) => warn!(product_id, error = %e, "earn redemption failed"),
            }
        }
        Ok(redeemed)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Parse Binance's array-of-arrays kline payload.
///
/// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
/// [5] volume (the remainder is ignored here).
pub(crate) fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;
    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }
        candles.push(Candle {
            open_time: arr[0].as_i64().unwrap_or(0),
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
        });
    }
    Ok(candles)
}

/// Normalise a raw order response into the internal order shape used by the
/// executors and the sink.
pub(crate) fn normalize_order(body: &serde_json::Value, symbol: &str) -> serde_json::Value {
    let executed = str_f64_or_zero(&body["executedQty"]);
    let quote = str_f64_or_zero(&body["cummulativeQuoteQty"]);
    let avg_price = if executed > 0.0 && quote > 0.0 {
        quote / executed
    } else {
        str_f64_or_zero(&body["price"])
    };
    let status = body["status"].as_str().unwrap_or("").to_uppercase();
    let normalized_status = if status == "FILLED" { "closed" } else { "open" };

    serde_json::json!({
        "id": body["orderId"].as_i64().map(|v| v.to_string())
            .unwrap_or_else(|| body["orderId"].to_string()),
        "symbol": symbol,
        "side": body["side"].as_str().unwrap_or("").to_lowercase(),
        "type": body["type"].as_str().unwrap_or("").to_lowercase(),
        "amount": str_f64_or_zero(&body["origQty"]),
        "filled": executed,
        "price": avg_price,
        "status": normalized_status,
        "timestamp": body["transactTime"].as_i64()
            .or_else(|| body["time"].as_i64())
            .unwrap_or_else(|| super::timestamp_ms() as i64),
    })
}

impl std::fmt::Debug for SpotClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_klines_ok() {
        let body = serde_json::json!([
            [1700000000000i64, "100.0", "101.0", "99.0", "100.5", "12.5", 1700000059999i64, "x", 5, "y", "z"],
            [1700000060000i64, "100.5", "102.0", "100.0", "101.5", "8.0", 1700000119999i64, "x", 3, "y", "z"]
        ]);
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, 1700000000000);
        assert!((candles[1].close - 101.5).abs() < f64::EPSILON);
    }

    #[test]
    fn normalize_order_computes_avg_price() {
        let raw = serde_json::json!({
            "orderId": 12345,
            "side": "BUY",
            "type": "MARKET",
            "origQty": "0.5",
            "executedQty": "0.5",
            "cummulativeQuoteQty": "25000.0",
            "status": "FILLED",
            "transactTime": 1700000000000i64
        });
        let order = normalize_order(&raw, "BTC/USDT");
        assert_eq!(order["id"], "12345");
        assert_eq!(order["status"], "closed");
        assert!((order["price"].as_f64().unwrap() - 50000.0).abs() < 1e-9);
        assert!((order["filled"].as_f64().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn normalize_order_unfilled_stays_open() {
        let raw = serde_json::json!({
            "orderId": 9,
            "side": "SELL",
            "type": "LIMIT",
            "origQty": "1.0",
            "executedQty": "0",
            "cummulativeQuoteQty": "0",
            "price": "123.0",
            "status": "NEW"
        });
        let order = normalize_order(&raw, "ETH/USDT");
        assert_eq!(order["status"], "open");
        assert!((order["price"].as_f64().unwrap() - 123.0).abs() < 1e-12);
    }
}
