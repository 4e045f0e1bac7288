// =============================================================================
// Position reconciler — exchange vs memory vs sink, exchange wins
// =============================================================================
//
// Runs at startup and periodically. Rules:
//   phantom  (memory, not exchange)        → remove from memory and sink
//   orphan   (exchange, not memory)        → adopt if the symbol is configured,
//                                            with fixed-% fallback SL/TP
//   drift    (both, quantity differs > 1%) → replace with exchange values,
//                                            keeping SL/TP when still valid
//
// Spot is approximate: base-asset free balance stands in for a position.
// Everything here is idempotent — a second pass over unchanged exchange
// state mutates nothing.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::config::Settings;
use crate::exchange::futures::FuturesClient;
use crate::exchange::spot::SpotClient;
use crate::risk::futures::FuturesRiskManager;
use crate::risk::spot::SpotRiskManager;
use crate::sink::Sink;
use crate::types::{PositionSide, TradingMode};

pub struct Reconciler {
    spot_exchange: Option<Arc<SpotClient>>,
    futures_exchange: Option<Arc<FuturesClient>>,
    spot_risk: Option<Arc<SpotRiskManager>>,
    futures_risk: Option<Arc<FuturesRiskManager>>,
    sink: Arc<Sink>,
}

impl Reconciler {
    pub fn new(
        spot_exchange: Option<Arc<SpotClient>>,
        futures_exchange: Option<Arc<FuturesClient>>,
        spot_risk: Option<Arc<SpotRiskManager>>,
        futures_risk: Option<Arc<FuturesRiskManager>>,
        sink: Arc<Sink>,
    ) -> Self {
        Self {
            spot_exchange,
            futures_exchange,
            spot_risk,
            futures_risk,
            sink,
        }
    }

    /// Run both alignments (spot + futures).
    pub async fn reconcile_all(&self, settings: &Settings, label: &str) {
        info!(label, "position reconciliation started");
        self.reconcile_spot(settings).await;
        self.reconcile_futures(settings).await;
    }

    // -------------------------------------------------------------------------
    // Futures
    // -------------------------------------------------------------------------

    /// Fixed-% fallback SL/TP — adoption has no OHLCV on hand for ATR.
    fn fallback_sl_tp(settings: &Settings, side: PositionSide, entry: f64) -> (f64, f64) {
        let fc = &settings.futures;
        match side {
            PositionSide::Long => (
                entry * (1.0 - fc.stop_loss_pct),
                entry * (1.0 + fc.take_profit_pct),
            ),
            PositionSide::Short => (
                entry * (1.0 + fc.stop_loss_pct),
                entry * (1.0 - fc.take_profit_pct),
            ),
        }
    }

    pub async fn reconcile_futures(&self, settings: &Settings) {
        let (Some(exchange), Some(risk)) = (&self.futures_exchange, &self.futures_risk) else {
            return;
        };
        let fc = &settings.futures;
        // Plain paper mode has no exchange truth to compare against.
        if fc.mode == TradingMode::Paper && !settings.exchange.testnet {
            return;
        }

        let exchange_positions = match exchange.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "futures position query failed — reconciliation skipped");
                return;
            }
        };

        let exchange_map: HashMap<(String, PositionSide), _> = exchange_positions
            .into_iter()
            .map(|p| ((p.symbol.clone(), p.side), p))
            .collect();
        let memory_positions = risk.get_all_positions();
        let mode = fc.mode.as_str();
        let mut changes = 0u32;

        // 1. Phantoms: in memory, absent on the exchange.
        for position in &memory_positions {
            let key = (position.symbol.clone(), position.side);
            if !exchange_map.contains_key(&key) {
                warn!(
                    symbol = %position.symbol,
                    side = %position.side,
                    quantity = position.quantity,
                    "phantom futures position — removing"
                );
                risk.force_remove_position(&position.symbol, position.side);
                self.sink
                    .delete_position(&position.symbol, mode, "futures", position.side.as_str())
                    .await;
                changes += 1;
            }
        }

        // 2. Orphans: on the exchange, absent in memory.
        let memory_keys: std::collections::HashSet<(String, PositionSide)> = memory_positions
            .iter()
            .map(|p| (p.symbol.clone(), p.side))
            .collect();
        for ((symbol, side), ex) in &exchange_map {
            if memory_keys.contains(&(symbol.clone(), *side)) {
                continue;
            }
            if !fc.pairs.iter().any(|p| p == symbol) {
                info!(symbol = %symbol, side = %side, "orphan position outside configured pairs — skipped");
                continue;
            }

            // Testnet sometimes reports entry 0 — mark price stands in; a
            // default 1x leverage report defers to the configured value.
            let entry = if ex.entry_price > 0.0 { ex.entry_price } else { ex.mark_price };
            let leverage = ex.leverage.max(fc.leverage);
            let (sl, tp) = if entry > 0.0 {
                Self::fallback_sl_tp(settings, *side, entry)
            } else {
                (0.0, 0.0)
            };
            warn!(
                symbol = %symbol,
                side = %side,
                quantity = ex.contracts,
                entry,
                leverage,
                sl,
                tp,
                "orphan futures position — adopting"
            );
            risk.add_position(symbol, *side, ex.contracts, entry, leverage, None, None, sl, tp);
            self.sink
                .upsert_position(
                    symbol,
                    json!({
                        "side": side.as_str(),
                        "leverage": leverage,
                        "quantity": ex.contracts,
                        "entry_price": entry,
                        "current_price": ex.mark_price,
                        "unrealized_pnl": ex.unrealized_pnl,
                        "liquidation_price": ex.liquidation_price,
                        "margin_type": ex.margin_type,
                        "stop_loss": sl,
                        "take_profit": tp,
                    }),
                    mode,
                    "futures",
                )
                .await;
            changes += 1;
        }

        // 3. Size drift: both sides present, quantity differs > 1%.
        for position in &memory_positions {
            let key = (position.symbol.clone(), position.side);
            let Some(ex) = exchange_map.get(&key) else { continue };
            let ex_qty = ex.contracts;
            if ex_qty <= 0.0 || ((ex_qty - position.quantity).abs() / ex_qty) <= 0.01 {
                continue;
            }

            let entry = if ex.entry_price > 0.0 { ex.entry_price } else { position.entry_price };
            let leverage = ex.leverage.max(fc.leverage);
            // Keep existing SL/TP when valid; recompute fallback otherwise.
            let (mut sl, mut tp) = (position.stop_loss_price, position.take_profit_price);
            if (sl <= 0.0 || tp <= 0.0) && entry > 0.0 {
                let fallback = Self::fallback_sl_tp(settings, position.side, entry);
                sl = fallback.0;
                tp = fallback.1;
            }
            warn!(
                symbol = %position.symbol,
                side = %position.side,
                memory_qty = position.quantity,
                exchange_qty = ex_qty,
                "futures quantity drift — correcting to exchange"
            );
            risk.force_remove_position(&position.symbol, position.side);
            risk.add_position(
                &position.symbol,
                position.side,
                ex_qty,
                entry,
                leverage,
                None,
                None,
                sl,
                tp,
            );
            self.sink
                .upsert_position(
                    &position.symbol,
                    json!({
                        "side": position.side.as_str(),
                        "leverage": leverage,
                        "quantity": ex_qty,
                        "entry_price": entry,
                        "current_price": ex.mark_price,
                        "unrealized_pnl": ex.unrealized_pnl,
                        "liquidation_price": ex.liquidation_price,
                        "margin_type": ex.margin_type,
                        "stop_loss": sl,
                        "take_profit": tp,
                    }),
                    mode,
                    "futures",
                )
                .await;
            changes += 1;
        }

        if changes == 0 {
            info!("futures positions fully aligned");
        }
    }

    // -------------------------------------------------------------------------
    // Spot
    // -------------------------------------------------------------------------

    /// Approximate spot alignment against wallet balances. Phantoms are
    /// removed and shrunk holdings downsized; orphan balances are never
    /// adopted (spot balances exist for many non-bot reasons).
    pub async fn reconcile_spot(&self, settings: &Settings) {
        let (Some(exchange), Some(risk)) = (&self.spot_exchange, &self.spot_risk) else {
            return;
        };
        let sc = &settings.spot;
        if sc.mode == TradingMode::Paper && !settings.exchange.testnet {
            return;
        }

        let balances = match exchange.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "spot balance query failed — reconciliation skipped");
                return;
            }
        };

        let memory_positions = risk.get_all_positions();
        let mode = sc.mode.as_str();
        let mut changes = 0u32;

        for (symbol, position) in memory_positions {
            let base_asset = symbol.split('/').next().unwrap_or("");
            let exchange_qty = balances.get(base_asset).copied().unwrap_or(0.0);
            let memory_qty = position.quantity;

            if exchange_qty < memory_qty * 0.01 {
                warn!(
                    symbol = %symbol,
                    memory_qty,
                    exchange_qty,
                    "phantom spot position — removing"
                );
                risk.force_remove_position(&symbol);
                self.sink.delete_position(&symbol, mode, "spot", "long").await;
                changes += 1;
            } else if exchange_qty < memory_qty * 0.95 {
                warn!(
                    symbol = %symbol,
                    memory_qty,
                    exchange_qty,
                    "spot quantity shrank — downsizing to balance"
                );
                let entry = position.entry_price;
                risk.force_remove_position(&symbol);
                risk.add_position(
                    &symbol,
                    exchange_qty,
                    entry,
                    position.tp_order_id.clone(),
                    position.sl_order_id.clone(),
                    position.stop_loss_price,
                    position.take_profit_price,
                    position.entry_horizon,
                    position.entry_reasoning.clone(),
                );
                self.sink
                    .upsert_position(
                        &symbol,
                        json!({
                            "quantity": exchange_qty,
                            "entry_price": entry,
                            "current_price": entry,
                        }),
                        mode,
                        "spot",
                    )
                    .await;
                changes += 1;
            }
        }

        if changes == 0 {
            info!("spot positions fully aligned");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HorizonRiskConfig;
    use crate::types::Horizon;

    fn settings() -> Settings {
        let exchange = crate::config::ExchangeConfig {
            api_key: "k".into(),
            api_secret: "s".into(),
            testnet: true,
            testnet_api_key: String::new(),
            testnet_api_secret: String::new(),
            futures_api_key: String::new(),
            futures_api_secret: String::new(),
        };
        let remote = serde_json::json!({});
        let base = Settings {
            exchange,
            spot: serde_yaml::from_str("{}").unwrap(),
            futures: serde_yaml::from_str("{}").unwrap(),
            horizon_risk: HorizonRiskConfig::default(),
            strategies: Vec::new(),
            orderflow: serde_yaml::from_str("{}").unwrap(),
            llm: serde_yaml::from_str("{}").unwrap(),
            loan_guard: serde_yaml::from_str("{}").unwrap(),
            mtf: serde_yaml::from_str("{}").unwrap(),
            logging: crate::config::LoggingConfig::default(),
        };
        Settings::from_value(&remote, &base).unwrap()
    }

    #[test]
    fn fallback_sl_tp_sides() {
        let s = settings();
        // Futures defaults: SL 2%, TP 4%.
        let (sl, tp) = Reconciler::fallback_sl_tp(&s, PositionSide::Long, 100.0);
        assert!((sl - 98.0).abs() < 1e-9);
        assert!((tp - 104.0).abs() < 1e-9);
        let (sl, tp) = Reconciler::fallback_sl_tp(&s, PositionSide::Short, 100.0);
        assert!((sl - 102.0).abs() < 1e-9);
        assert!((tp - 96.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn spot_phantom_removed_and_idempotent() {
        // Scenario S5 in miniature, via the spot path (no network in paper
        // mode — the reconciler needs a client, so drive the risk manager
        // directly through the same rules).
        let s = settings();
        let risk = Arc::new(SpotRiskManager::new(
            s.spot.clone(),
            HorizonRiskConfig::default(),
        ));
        risk.add_position(
            "BTC/USDT", 0.01, 50_000.0, None, None, 48_000.0, 55_000.0,
            Horizon::Medium, String::new(),
        );
        assert_eq!(risk.open_position_count(), 1);

        // Exchange reports no BTC: phantom rule fires.
        let balances: HashMap<String, f64> = HashMap::new();
        let position = risk.get_position("BTC/USDT").unwrap();
        let base = "BTC";
        let exchange_qty = balances.get(base).copied().unwrap_or(0.0);
        assert!(exchange_qty < position.quantity * 0.01);
        risk.force_remove_position("BTC/USDT");
        assert_eq!(risk.open_position_count(), 0);

        // Second pass finds nothing to mutate.
        risk.force_remove_position("BTC/USDT");
        assert_eq!(risk.open_position_count(), 0);
    }
}
