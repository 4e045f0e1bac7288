// =============================================================================
// Spot order executor — risk-approved signals → exchange effects
// =============================================================================
//
// Paper mode synthesises fills at the current ticker price; live mode sends
// market orders. Protective exits use a single OCO sell (limit-maker TP +
// stop-loss-limit SL); when OCO placement fails the handler falls back to
// price polling.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::exchange::spot::SpotClient;
use crate::risk::spot::RiskOutput;
use crate::types::{Signal, TradingMode};

pub struct SpotExecutor {
    client: Arc<SpotClient>,
    mode: TradingMode,
}

impl SpotExecutor {
    pub fn new(client: Arc<SpotClient>, mode: TradingMode) -> Self {
        Self { client, mode }
    }

    /// True when orders actually reach an exchange (live or testnet).
    pub fn is_live(&self) -> bool {
        self.mode != TradingMode::Paper
    }

    /// Execute a risk-approved signal. Returns the normalised order, or None
    /// when the order was skipped (below exchange minimums) or failed.
    pub async fn execute(
        &self,
        signal: Signal,
        symbol: &str,
        risk_output: &RiskOutput,
    ) -> Option<serde_json::Value> {
        let side = if signal == Signal::Buy { "buy" } else { "sell" };
        let quantity = risk_output.quantity;

        // Exchange minimums: quantity step and notional floor.
        let min_amount = self.client.get_min_order_amount(symbol).await.unwrap_or(0.0);
        if quantity < min_amount {
            warn!(
                symbol,
                quantity, min_amount, "quantity below exchange minimum — skipped"
            );
            return None;
        }
        let ticker = match self.client.get_ticker(symbol).await {
            Ok(t) => t,
            Err(e) => {
                warn!(symbol, error = %e, "ticker unavailable — order skipped");
                return None;
            }
        };
        let min_notional = self.client.get_min_notional(symbol).await.unwrap_or(0.0);
        if min_notional > 0.0 && quantity * ticker.last < min_notional {
            warn!(
                symbol,
                notional = quantity * ticker.last,
                min_notional,
                "notional below exchange minimum — skipped"
            );
            return None;
        }

        if self.mode == TradingMode::Paper {
            return Some(self.paper_execute(side, symbol, quantity, ticker.last, ticker.timestamp));
        }
        self.live_execute(side, symbol, quantity).await
    }

    fn paper_execute(
        &self,
        side: &str,
        symbol: &str,
        quantity: f64,
        price: f64,
        timestamp: i64,
    ) -> serde_json::Value {
        info!(
            side = side.to_uppercase(),
            symbol,
            quantity,
            price,
            notional = quantity * price,
            "[paper] simulated fill"
        );
        serde_json::json!({
            "id": format!("paper_{timestamp}"),
            "symbol": symbol,
            "side": side,
            "type": "market",
            "amount": quantity,
            "price": price,
            "filled": quantity,
            "status": "closed",
            "timestamp": timestamp,
        })
    }

    async fn live_execute(
        &self,
        side: &str,
        symbol: &str,
        quantity: f64,
    ) -> Option<serde_json::Value> {
        info!(side = side.to_uppercase(), symbol, quantity, "[live] placing market order");
        match self.client.place_market_order(symbol, side, quantity).await {
            Ok(order) => {
                info!(
                    id = %order["id"],
                    filled = order["filled"].as_f64().unwrap_or(0.0),
                    price = order["price"].as_f64().unwrap_or(0.0),
                    "[live] order filled"
                );
                Some(order)
            }
            Err(e) => {
                error!(symbol, side, error = %e, "[live] order failed");
                None
            }
        }
    }

    /// Attach protective SL/TP after a BUY fill. Returns
    /// `{tp_order_id, sl_order_id}` (both null in paper mode), or None when
    /// placement failed — the caller then relies on price polling.
    pub async fn place_sl_tp(
        &self,
        symbol: &str,
        quantity: f64,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Option<serde_json::Value> {
        if self.mode == TradingMode::Paper {
            info!(
                symbol,
                take_profit_price, stop_loss_price, "[paper] simulated SL/TP placement"
            );
            return Some(serde_json::json!({
                "oco_id": "paper_oco",
                "tp_order_id": null,
                "sl_order_id": null,
            }));
        }

        match self
            .client
            .place_oco_sell(symbol, quantity, take_profit_price, stop_loss_price)
            .await
        {
            Ok(info) => Some(info),
            Err(e) => {
                error!(symbol, error = %e, "OCO placement failed — price polling takes over");
                None
            }
        }
    }

    /// Cancel resting SL/TP orders ahead of a manual sell. Not-found errors
    /// are swallowed by the client.
    pub async fn cancel_sl_tp(
        &self,
        symbol: &str,
        tp_order_id: Option<&str>,
        sl_order_id: Option<&str>,
    ) {
        if self.mode == TradingMode::Paper {
            return;
        }
        for order_id in [tp_order_id, sl_order_id].into_iter().flatten() {
            if let Err(e) = self.client.cancel_order(order_id, symbol).await {
                warn!(symbol, order_id, error = %e, "SL/TP cancel failed");
            }
        }
    }

    /// Query one order's normalised status.
    pub async fn order_status(&self, order_id: &str, symbol: &str) -> Result<serde_json::Value> {
        self.client.get_order_status(order_id, symbol).await
    }
}
