// =============================================================================
// Futures order executor — signal → (side, reduce_only) → exchange effects
// =============================================================================
//
// Mapping: BUY opens long (buy), SHORT opens short (sell), SELL closes long
// (sell, reduce-only), COVER closes short (buy, reduce-only). Protective
// exits are two independent reduce-only orders: take-profit-market plus
// stop-market.
//
// Paper mode with testnet keys available routes through the testnet for real
// order flow; plain paper mode synthesises fills locally.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::exchange::futures::FuturesClient;
use crate::risk::futures::FuturesRiskOutput;
use crate::types::{PositionSide, Signal, TradingMode};

pub struct FuturesExecutor {
    client: Arc<FuturesClient>,
    mode: TradingMode,
    /// Paper + testnet keys → orders go to the testnet environment.
    use_testnet_live: bool,
}

impl FuturesExecutor {
    pub fn new(client: Arc<FuturesClient>, mode: TradingMode, is_testnet: bool) -> Self {
        Self {
            client,
            mode,
            use_testnet_live: mode == TradingMode::Paper && is_testnet,
        }
    }

    pub fn is_live(&self) -> bool {
        self.mode == TradingMode::Live
            || self.mode == TradingMode::Testnet
            || self.use_testnet_live
    }

    fn signal_mapping(signal: Signal) -> Option<(&'static str, bool)> {
        match signal {
            Signal::Buy => Some(("buy", false)),
            Signal::Short => Some(("sell", false)),
            Signal::Sell => Some(("sell", true)),
            Signal::Cover => Some(("buy", true)),
            Signal::Hold => None,
        }
    }

    /// Execute a risk-approved futures signal.
    pub async fn execute(
        &self,
        signal: Signal,
        symbol: &str,
        risk_output: &FuturesRiskOutput,
    ) -> Option<serde_json::Value> {
        let Some((side, reduce_only)) = Self::signal_mapping(signal) else {
            warn!(symbol, signal = %signal, "unsupported futures signal");
            return None;
        };
        let quantity = risk_output.quantity;

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

        if self.is_live() {
            let label = if self.use_testnet_live { "testnet" } else { "live" };
            self.live_execute(side, symbol, quantity, reduce_only, label)
                .await
        } else {
            Some(self.paper_execute(side, symbol, quantity, reduce_only, ticker.last, ticker.timestamp))
        }
    }

    fn paper_execute(
        &self,
        side: &str,
        symbol: &str,
        quantity: f64,
        reduce_only: bool,
        price: f64,
        timestamp: i64,
    ) -> serde_json::Value {
        info!(
            side = side.to_uppercase(),
            symbol,
            quantity,
            price,
            reduce_only,
            notional = quantity * price,
            "[paper futures] simulated fill"
        );
        serde_json::json!({
            "id": format!("paper_futures_{timestamp}"),
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
        reduce_only: bool,
        label: &str,
    ) -> Option<serde_json::Value> {
        info!(
            side = side.to_uppercase(),
            symbol, quantity, reduce_only, label, "placing futures market order"
        );
        match self
            .client
            .place_market_order(symbol, side, quantity, reduce_only)
            .await
        {
            Ok(order) => {
                info!(
                    id = %order["id"],
                    filled = order["filled"].as_f64().unwrap_or(0.0),
                    price = order["price"].as_f64().unwrap_or(0.0),
                    label,
                    "futures order filled"
                );
                Some(order)
            }
            Err(e) => {
                // A rejected reduce-only means the exchange has no matching
                // position; the reconciler cleans that up on its next pass.
                error!(symbol, side, reduce_only, error = %e, "futures order failed");
                None
            }
        }
    }

    /// Attach protective exits after an open: take-profit-market + stop-market,
    /// both reduce-only, closing in the direction opposite to the position.
    pub async fn place_sl_tp(
        &self,
        symbol: &str,
        quantity: f64,
        position_side: PositionSide,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Option<serde_json::Value> {
        let close_side = match position_side {
            PositionSide::Long => "sell",
            PositionSide::Short => "buy",
        };

        if !self.is_live() {
            info!(
                symbol,
                side = %position_side,
                take_profit_price,
                stop_loss_price,
                "[paper futures] simulated SL/TP placement"
            );
            return Some(serde_json::json!({
                "tp_order_id": null,
                "sl_order_id": null,
            }));
        }

        let mut tp_id: Option<String> = None;
        let mut sl_id: Option<String> = None;

        match self
            .client
            .place_take_profit_market(symbol, close_side, quantity, take_profit_price)
            .await
        {
            Ok(order) => tp_id = order["id"].as_str().map(|s| s.to_string()),
            Err(e) => error!(symbol, error = %e, "take-profit placement failed"),
        }
        match self
            .client
            .place_stop_market(symbol, close_side, quantity, stop_loss_price)
            .await
        {
            Ok(order) => sl_id = order["id"].as_str().map(|s| s.to_string()),
            Err(e) => error!(symbol, error = %e, "stop-loss placement failed"),
        }

        Some(serde_json::json!({
            "tp_order_id": tp_id,
            "sl_order_id": sl_id,
        }))
    }

    /// Cancel resting SL/TP ahead of a manual close.
    pub async fn cancel_sl_tp(
        &self,
        symbol: &str,
        tp_order_id: Option<&str>,
        sl_order_id: Option<&str>,
    ) {
        if !self.is_live() {
            return;
        }
        for order_id in [tp_order_id, sl_order_id].into_iter().flatten() {
            if let Err(e) = self.client.cancel_order(order_id, symbol).await {
                warn!(symbol, order_id, error = %e, "SL/TP cancel failed");
            }
        }
    }

    pub async fn order_status(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> anyhow::Result<serde_json::Value> {
        self.client.get_order_status(order_id, symbol).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_mapping_table() {
        assert_eq!(FuturesExecutor::signal_mapping(Signal::Buy), Some(("buy", false)));
        assert_eq!(FuturesExecutor::signal_mapping(Signal::Short), Some(("sell", false)));
        assert_eq!(FuturesExecutor::signal_mapping(Signal::Sell), Some(("sell", true)));
        assert_eq!(FuturesExecutor::signal_mapping(Signal::Cover), Some(("buy", true)));
        assert_eq!(FuturesExecutor::signal_mapping(Signal::Hold), None);
    }
}
