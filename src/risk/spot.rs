// =============================================================================
// Spot risk manager — sizing, SL/TP resolution, daily-loss and position caps
// =============================================================================
//
// Invariants held between calls:
//   - daily realized PnL resets at the UTC date boundary;
//   - the open-position map is authoritative for its symbols.
//
// Thread-safety: all mutable state sits behind one parking_lot::Mutex; the
// manager is the sole mutator of spot positions.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{HorizonRiskConfig, SpotConfig};
use crate::data::models::Candle;
use crate::indicators::{compute_bollinger, compute_fibonacci_levels, compute_support_resistance};
use crate::risk::metrics::RiskMetrics;
use crate::risk::resolve_sl_tp;
use crate::types::{Horizon, Signal};

/// One tracked spot holding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotPosition {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub entry_horizon: Horizon,
    pub entry_reasoning: String,
}

/// Outcome of a risk evaluation.
#[derive(Debug, Clone, Default)]
pub struct RiskOutput {
    pub approved: bool,
    pub quantity: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub reason: String,
}

impl RiskOutput {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            ..Default::default()
        }
    }
}

struct Inner {
    open_positions: HashMap<String, SpotPosition>,
    daily_pnl: f64,
    pnl_date: NaiveDate,
}

pub struct SpotRiskManager {
    config: RwLock<SpotConfig>,
    horizon: RwLock<HorizonRiskConfig>,
    state: Mutex<Inner>,
}

impl SpotRiskManager {
    pub fn new(config: SpotConfig, horizon: HorizonRiskConfig) -> Self {
        Self {
            config: RwLock::new(config),
            horizon: RwLock::new(horizon),
            state: Mutex::new(Inner {
                open_positions: HashMap::new(),
                daily_pnl: 0.0,
                pnl_date: Utc::now().date_naive(),
            }),
        }
    }

    /// Swap in fresh parameters on config hot-reload; positions survive.
    pub fn update_config(&self, config: SpotConfig, horizon: HorizonRiskConfig) {
        *self.config.write() = config;
        *self.horizon.write() = horizon;
    }

    fn reset_daily_pnl_if_needed(inner: &mut Inner) {
        let today = Utc::now().date_naive();
        if inner.pnl_date != today {
            inner.daily_pnl = 0.0;
            inner.pnl_date = today;
        }
    }

    // -------------------------------------------------------------------------
    // Advisory metrics
    // -------------------------------------------------------------------------

    /// Pre-compute the risk picture for a prospective BUY. Only trivially
    /// checkable gates set `reason`; nothing is reserved.
    pub fn pre_calculate_metrics(
        &self,
        signal: Signal,
        symbol: &str,
        price: f64,
        balance: f64,
        ohlcv: Option<&[Candle]>,
        horizon: Horizon,
    ) -> Option<RiskMetrics> {
        if signal != Signal::Buy {
            return None;
        }

        let reason = {
            let mut inner = self.state.lock();
            Self::reset_daily_pnl_if_needed(&mut inner);
            if inner.daily_pnl < -(balance * self.config.read().max_daily_loss_pct) {
                format!(
                    "daily loss limit reached ({:.1}%)",
                    self.config.read().max_daily_loss_pct * 100.0
                )
            } else if inner.open_positions.len() >= self.config.read().max_open_positions as usize {
                format!("max open positions reached ({})", self.config.read().max_open_positions)
            } else if inner.open_positions.contains_key(symbol) {
                format!("already holding {symbol}")
            } else {
                String::new()
            }
        };

        let hp = self.horizon.read().params(horizon);
        let resolved = resolve_sl_tp(
            false,
            price,
            &hp,
            0.0,
            0.0,
            ohlcv,
            self.config.read().atr.enabled,
            self.config.read().atr.period as usize,
        );
        let rr = if resolved.sl_distance > 0.0 {
            resolved.tp_distance / resolved.sl_distance
        } else {
            0.0
        };
        let passes_rr = rr >= hp.min_rr;

        let atr_value = if self.config.read().atr.enabled {
            ohlcv
                .map(|c| crate::indicators::compute_atr(c, self.config.read().atr.period as usize))
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let mut metrics = RiskMetrics {
            stop_loss_price: resolved.stop_loss,
            take_profit_price: resolved.take_profit,
            sl_distance: resolved.sl_distance,
            tp_distance: resolved.tp_distance,
            risk_reward_ratio: rr,
            atr_value,
            atr_used: atr_value > 0.0,
            leverage: 1,
            liquidation_price: 0.0,
            account_risk_pct: (resolved.sl_distance / price.max(1e-10))
                * self.config.read().max_position_pct,
            passes_min_rr: passes_rr,
            reason,
            ..Default::default()
        };

        if let Some(candles) = ohlcv {
            metrics.fib_levels = compute_fibonacci_levels(candles, 5);
            let sr = compute_support_resistance(candles, 5, 3);
            metrics.support_levels = sr.support;
            metrics.resistance_levels = sr.resistance;
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            if let Some(bb) = compute_bollinger(&closes, 20, 2.0) {
                metrics.bb_upper = bb.upper;
                metrics.bb_mid = bb.mid;
                metrics.bb_lower = bb.lower;
                metrics.bb_pct_b = bb.pct_b;
            }
        }

        Some(metrics)
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate a trade signal. The daily-loss cap blocks BUY only — selling
    /// out of risk is always allowed.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        signal: Signal,
        symbol: &str,
        price: f64,
        balance: f64,
        horizon: Horizon,
        llm_size_pct: f64,
        llm_stop_loss: f64,
        llm_take_profit: f64,
        ohlcv: Option<&[Candle]>,
    ) -> RiskOutput {
        let mut inner = self.state.lock();
        Self::reset_daily_pnl_if_needed(&mut inner);

        match signal {
            Signal::Buy => self.evaluate_buy(
                &inner,
                symbol,
                price,
                balance,
                horizon,
                llm_size_pct,
                llm_stop_loss,
                llm_take_profit,
                ohlcv,
            ),
            Signal::Sell => Self::evaluate_sell(&inner, symbol),
            _ => RiskOutput::rejected("HOLD signal"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_buy(
        &self,
        inner: &Inner,
        symbol: &str,
        price: f64,
        balance: f64,
        horizon: Horizon,
        llm_size_pct: f64,
        llm_stop_loss: f64,
        llm_take_profit: f64,
        ohlcv: Option<&[Candle]>,
    ) -> RiskOutput {
        // 1. Daily loss cap (openings only).
        if inner.daily_pnl < -(balance * self.config.read().max_daily_loss_pct) {
            let reason = format!(
                "daily loss limit reached ({:.1}%)",
                self.config.read().max_daily_loss_pct * 100.0
            );
            warn!(symbol, "{}", reason);
            return RiskOutput::rejected(reason);
        }

        // 2. Position-count cap.
        if inner.open_positions.len() >= self.config.read().max_open_positions as usize {
            let reason = format!("max open positions reached ({})", self.config.read().max_open_positions);
            warn!(symbol, "{}", reason);
            return RiskOutput::rejected(reason);
        }

        // 3. No doubling into the same symbol.
        if inner.open_positions.contains_key(symbol) {
            let reason = format!("already holding {symbol}");
            info!("{}", reason);
            return RiskOutput::rejected(reason);
        }

        // 4. SL/TP resolution: LLM → ATR → fixed-%.
        let hp = self.horizon.read().params(horizon);
        let mut resolved = resolve_sl_tp(
            false,
            price,
            &hp,
            llm_stop_loss,
            llm_take_profit,
            ohlcv,
            self.config.read().atr.enabled,
            self.config.read().atr.period as usize,
        );
        if !resolved.note.is_empty() {
            info!(symbol, note = %resolved.note, "SL/TP resolution note");
        }
        // Hold the per-horizon R:R floor on the fallback paths as well by
        // stretching the target.
        if resolved.sl_distance > 0.0 {
            let rr = resolved.tp_distance / resolved.sl_distance;
            if rr < hp.min_rr {
                resolved.tp_distance = resolved.sl_distance * hp.min_rr;
                resolved.take_profit = price + resolved.tp_distance;
            }
        }

        // 5. Horizon-scaled sizing, capped by the LLM's suggestion.
        let mut notional = balance * self.config.read().max_position_pct * hp.size_factor;
        if llm_size_pct > 0.0 {
            notional = notional.min(balance * llm_size_pct);
        }
        let quantity = notional / price;
        if quantity <= 0.0 {
            return RiskOutput::rejected("computed quantity is zero");
        }

        info!(
            symbol,
            quantity,
            stop_loss = resolved.stop_loss,
            take_profit = resolved.take_profit,
            horizon = %horizon,
            "risk approved BUY"
        );

        RiskOutput {
            approved: true,
            quantity,
            stop_loss_price: resolved.stop_loss,
            take_profit_price: resolved.take_profit,
            reason: String::new(),
        }
    }

    fn evaluate_sell(inner: &Inner, symbol: &str) -> RiskOutput {
        let Some(position) = inner.open_positions.get(symbol) else {
            let reason = format!("no position in {symbol} to sell");
            info!("{}", reason);
            return RiskOutput::rejected(reason);
        };

        info!(symbol, quantity = position.quantity, "risk approved SELL");
        RiskOutput {
            approved: true,
            quantity: position.quantity,
            stop_loss_price: 0.0,
            take_profit_price: 0.0,
            reason: String::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Position tracking
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_position(
        &self,
        symbol: &str,
        quantity: f64,
        entry_price: f64,
        tp_order_id: Option<String>,
        sl_order_id: Option<String>,
        stop_loss_price: f64,
        take_profit_price: f64,
        entry_horizon: Horizon,
        entry_reasoning: String,
    ) {
        let position = SpotPosition {
            symbol: symbol.to_string(),
            quantity,
            entry_price,
            stop_loss_price,
            take_profit_price,
            tp_order_id,
            sl_order_id,
            opened_at: Utc::now(),
            entry_horizon,
            entry_reasoning,
        };
        self.state
            .lock()
            .open_positions
            .insert(symbol.to_string(), position);
        info!(symbol, quantity, entry_price, "position recorded");
    }

    /// Remove a position at `exit_price` and book the realised PnL.
    pub fn remove_position(&self, symbol: &str, exit_price: f64) -> f64 {
        let mut inner = self.state.lock();
        let Some(position) = inner.open_positions.remove(symbol) else {
            return 0.0;
        };
        let pnl = (exit_price - position.entry_price) * position.quantity;
        inner.daily_pnl += pnl;
        info!(
            symbol,
            pnl,
            entry = position.entry_price,
            exit = exit_price,
            "position removed"
        );
        pnl
    }

    /// Remove without touching PnL (reconciliation of phantoms).
    pub fn force_remove_position(&self, symbol: &str) {
        let removed = self.state.lock().open_positions.remove(symbol);
        if let Some(p) = removed {
            warn!(
                symbol,
                entry = p.entry_price,
                quantity = p.quantity,
                "phantom position force-removed"
            );
        }
    }

    /// Price-poll SL/TP check (paper mode or failed exchange placement).
    /// Prefers the stored prices; falls back to fixed percentages for
    /// positions restored without them.
    pub fn check_stop_loss_take_profit(&self, symbol: &str, current_price: f64) -> Signal {
        let (entry, mut stop_loss, mut take_profit) = {
            let inner = self.state.lock();
            let Some(p) = inner.open_positions.get(symbol) else {
                return Signal::Hold;
            };
            (p.entry_price, p.stop_loss_price, p.take_profit_price)
        };

        if stop_loss <= 0.0 || take_profit <= 0.0 {
            stop_loss = entry * (1.0 - self.config.read().stop_loss_pct);
            take_profit = entry * (1.0 + self.config.read().take_profit_pct);
        }

        if current_price <= stop_loss {
            warn!(symbol, current_price, stop_loss, "stop-loss triggered");
            return Signal::Sell;
        }
        if current_price >= take_profit {
            info!(symbol, current_price, take_profit, "take-profit triggered");
            return Signal::Sell;
        }
        Signal::Hold
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_position_count(&self) -> usize {
        self.state.lock().open_positions.len()
    }

    pub fn get_position(&self, symbol: &str) -> Option<SpotPosition> {
        self.state.lock().open_positions.get(symbol).cloned()
    }

    pub fn get_all_positions(&self) -> HashMap<String, SpotPosition> {
        self.state.lock().open_positions.clone()
    }

    pub fn get_sl_tp_order_ids(&self, symbol: &str) -> (Option<String>, Option<String>) {
        let inner = self.state.lock();
        match inner.open_positions.get(symbol) {
            Some(p) => (p.tp_order_id.clone(), p.sl_order_id.clone()),
            None => (None, None),
        }
    }

    pub fn has_exchange_sl_tp(&self, symbol: &str) -> bool {
        let (tp, sl) = self.get_sl_tp_order_ids(symbol);
        tp.is_some() || sl.is_some()
    }

    pub fn daily_pnl(&self) -> f64 {
        self.state.lock().daily_pnl
    }
}

impl std::fmt::Debug for SpotRiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.state.lock();
        f.debug_struct("SpotRiskManager")
            .field("open_positions", &inner.open_positions.len())
            .field("daily_pnl", &inner.daily_pnl)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SpotRiskManager {
        let config: SpotConfig = serde_yaml::from_str("{}").unwrap();
        SpotRiskManager::new(config, HorizonRiskConfig::default())
    }

    #[test]
    fn scenario_buy_approved_with_llm_prices() {
        // 1000 USDT balance, price 50000, LLM SL/TP 48500/53000.
        let m = manager();
        let out = m.evaluate(
            Signal::Buy,
            "BTC/USDT",
            50_000.0,
            1_000.0,
            Horizon::Medium,
            0.02,
            48_500.0,
            53_000.0,
            None,
        );
        assert!(out.approved, "{}", out.reason);
        // notional = 1000 × 0.02 → qty = 0.0004
        assert!((out.quantity - 0.0004).abs() < 1e-12);
        assert!((out.stop_loss_price - 48_500.0).abs() < 1e-9);
        assert!((out.take_profit_price - 53_000.0).abs() < 1e-9);
    }

    #[test]
    fn buy_rejected_when_already_holding() {
        let m = manager();
        m.add_position(
            "BTC/USDT", 0.001, 50_000.0, None, None, 48_000.0, 55_000.0,
            Horizon::Medium, String::new(),
        );
        let out = m.evaluate(
            Signal::Buy, "BTC/USDT", 50_000.0, 1_000.0, Horizon::Medium, 0.0, 0.0, 0.0, None,
        );
        assert!(!out.approved);
        assert!(out.reason.contains("already holding"));
    }

    #[test]
    fn buy_rejected_at_position_cap() {
        let m = manager();
        for sym in ["A/USDT", "B/USDT", "C/USDT"] {
            m.add_position(sym, 1.0, 10.0, None, None, 9.0, 12.0, Horizon::Medium, String::new());
        }
        let out = m.evaluate(
            Signal::Buy, "D/USDT", 10.0, 1_000.0, Horizon::Medium, 0.0, 0.0, 0.0, None,
        );
        assert!(!out.approved);
        assert!(out.reason.contains("max open positions"));
    }

    #[test]
    fn daily_loss_blocks_buy_not_sell() {
        let m = manager();
        m.add_position("A/USDT", 100.0, 10.0, None, None, 9.0, 12.0, Horizon::Medium, String::new());
        // Lose 60 USDT (cap at balance 1000 × 0.05 = 50).
        m.remove_position("A/USDT", 9.4);
        assert!(m.daily_pnl() < -50.0);

        let buy = m.evaluate(
            Signal::Buy, "B/USDT", 10.0, 1_000.0, Horizon::Medium, 0.0, 0.0, 0.0, None,
        );
        assert!(!buy.approved);
        assert!(buy.reason.contains("daily loss"));

        m.add_position("C/USDT", 5.0, 10.0, None, None, 9.0, 12.0, Horizon::Medium, String::new());
        let sell = m.evaluate(
            Signal::Sell, "C/USDT", 10.0, 0.0, Horizon::Medium, 0.0, 0.0, 0.0, None,
        );
        assert!(sell.approved);
        assert!((sell.quantity - 5.0).abs() < 1e-12);
    }

    #[test]
    fn sell_without_position_rejected() {
        let m = manager();
        let out = m.evaluate(
            Signal::Sell, "ETH/USDT", 100.0, 0.0, Horizon::Medium, 0.0, 0.0, 0.0, None,
        );
        assert!(!out.approved);
    }

    #[test]
    fn llm_size_pct_caps_quantity() {
        let m = manager();
        // llm 1% < config 2% → smaller size wins.
        let out = m.evaluate(
            Signal::Buy, "BTC/USDT", 100.0, 1_000.0, Horizon::Medium, 0.01, 0.0, 0.0, None,
        );
        assert!(out.approved);
        assert!((out.quantity - 0.1).abs() < 1e-9); // 1000 × 0.01 / 100
    }

    #[test]
    fn approved_buy_meets_rr_floor() {
        let m = manager();
        for horizon in [Horizon::Short, Horizon::Medium, Horizon::Long] {
            let out = m.evaluate(
                Signal::Buy,
                "X/USDT",
                100.0,
                1_000.0,
                horizon,
                0.0,
                0.0,
                0.0,
                None,
            );
            assert!(out.approved);
            let sl_dist = 100.0 - out.stop_loss_price;
            let tp_dist = out.take_profit_price - 100.0;
            let min_rr = HorizonRiskConfig::default().params(horizon).min_rr;
            assert!(
                tp_dist / sl_dist >= min_rr - 1e-9,
                "horizon {horizon}: rr {} < {min_rr}",
                tp_dist / sl_dist
            );
        }
    }

    #[test]
    fn sl_tp_poll_uses_stored_prices() {
        let m = manager();
        m.add_position(
            "BTC/USDT", 0.001, 50_000.0, None, None, 48_500.0, 53_000.0,
            Horizon::Medium, String::new(),
        );
        assert_eq!(m.check_stop_loss_take_profit("BTC/USDT", 50_500.0), Signal::Hold);
        assert_eq!(m.check_stop_loss_take_profit("BTC/USDT", 48_400.0), Signal::Sell);
        assert_eq!(m.check_stop_loss_take_profit("BTC/USDT", 53_100.0), Signal::Sell);
    }

    #[test]
    fn sl_tp_poll_fallback_for_legacy_position() {
        let m = manager();
        // Restored position without stored SL/TP → fixed-% fallback (3%/6%).
        m.add_position("BTC/USDT", 0.001, 50_000.0, None, None, 0.0, 0.0, Horizon::Medium, String::new());
        assert_eq!(m.check_stop_loss_take_profit("BTC/USDT", 48_400.0), Signal::Sell);
        assert_eq!(m.check_stop_loss_take_profit("BTC/USDT", 49_000.0), Signal::Hold);
        assert_eq!(m.check_stop_loss_take_profit("BTC/USDT", 53_100.0), Signal::Sell);
    }

    #[test]
    fn pre_metrics_marks_reason_on_cap() {
        let m = manager();
        for sym in ["A/USDT", "B/USDT", "C/USDT"] {
            m.add_position(sym, 1.0, 10.0, None, None, 9.0, 12.0, Horizon::Medium, String::new());
        }
        let metrics = m
            .pre_calculate_metrics(Signal::Buy, "D/USDT", 10.0, 1_000.0, None, Horizon::Medium)
            .unwrap();
        assert!(metrics.reason.contains("max open positions"));
        assert!(metrics.stop_loss_price > 0.0);
    }

    #[test]
    fn pre_metrics_none_for_sell() {
        let m = manager();
        assert!(m
            .pre_calculate_metrics(Signal::Sell, "A/USDT", 10.0, 1_000.0, None, Horizon::Medium)
            .is_none());
    }
}
