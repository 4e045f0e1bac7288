// =============================================================================
// Futures risk manager — leverage-aware gates, slot reservation, liquidation
// guard
// =============================================================================
//
// Gates on every open, in order: margin ratio, daily loss, position+slot cap,
// duplicate (symbol, side), R:R floor, account-risk cap, liquidation guard.
// Sizing is leverage- and horizon-scaled, capped by the LLM's suggestion.
//
// Slot reservation makes concurrent opens safe: reserve_slot atomically
// checks and inserts under the state mutex; confirm_position promotes the
// reservation into an open position; release_slot drops it on failure.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{FuturesConfig, HorizonRiskConfig};
use crate::data::models::Candle;
use crate::indicators::{compute_bollinger, compute_fibonacci_levels, compute_support_resistance};
use crate::risk::metrics::RiskMetrics;
use crate::risk::resolve_sl_tp;
use crate::types::{Horizon, PositionSide, Signal};

/// One tracked futures position, keyed by (symbol, side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub liquidation_price: f64,
    pub opened_at: DateTime<Utc>,
}

/// Outcome of a futures risk evaluation.
#[derive(Debug, Clone, Default)]
pub struct FuturesRiskOutput {
    pub approved: bool,
    pub quantity: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub leverage: u32,
    pub liquidation_price: f64,
    pub risk_reward_ratio: f64,
    pub reason: String,
}

impl FuturesRiskOutput {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            ..Default::default()
        }
    }
}

type PosKey = (String, PositionSide);

struct Inner {
    open_positions: HashMap<PosKey, FuturesPosition>,
    reserved_slots: HashSet<PosKey>,
    daily_pnl: f64,
    pnl_date: NaiveDate,
}

pub struct FuturesRiskManager {
    config: RwLock<FuturesConfig>,
    horizon: RwLock<HorizonRiskConfig>,
    state: Mutex<Inner>,
}

impl FuturesRiskManager {
    /// Binance USDT-M maintenance margin rate, simplified to one mid tier.
    pub const MAINTENANCE_MARGIN_RATE: f64 = 0.004;

    pub fn new(config: FuturesConfig, horizon: HorizonRiskConfig) -> Self {
        Self {
            config: RwLock::new(config),
            horizon: RwLock::new(horizon),
            state: Mutex::new(Inner {
                open_positions: HashMap::new(),
                reserved_slots: HashSet::new(),
                daily_pnl: 0.0,
                pnl_date: Utc::now().date_naive(),
            }),
        }
    }

    /// Swap in fresh parameters on config hot-reload; positions and
    /// reservations survive.
    pub fn update_config(&self, config: FuturesConfig, horizon: HorizonRiskConfig) {
        *self.config.write() = config;
        *self.horizon.write() = horizon;
    }

    fn key(symbol: &str, side: PositionSide) -> PosKey {
        (symbol.to_string(), side)
    }

    fn reset_daily_pnl_if_needed(inner: &mut Inner) {
        let today = Utc::now().date_naive();
        if inner.pnl_date != today {
            inner.daily_pnl = 0.0;
            inner.pnl_date = today;
        }
    }

    /// Liquidation price estimate for an entry at `price` under the account
    /// leverage.
    pub fn liquidation_price(side: PositionSide, price: f64, leverage: u32) -> f64 {
        let lev = leverage.max(1) as f64;
        match side {
            PositionSide::Long => price * (1.0 - 1.0 / lev + Self::MAINTENANCE_MARGIN_RATE),
            PositionSide::Short => price * (1.0 + 1.0 / lev - Self::MAINTENANCE_MARGIN_RATE),
        }
    }

    // -------------------------------------------------------------------------
    // Slot reservation
    // -------------------------------------------------------------------------

    /// Atomically reserve a position slot for (symbol, side). Returns false
    /// when the slot is taken or the combined cap is reached.
    pub fn reserve_slot(&self, symbol: &str, side: PositionSide) -> bool {
        let key = Self::key(symbol, side);
        let mut inner = self.state.lock();
        if inner.open_positions.contains_key(&key) || inner.reserved_slots.contains(&key) {
            return false;
        }
        let total = inner.open_positions.len() + inner.reserved_slots.len();
        if total >= self.config.read().max_open_positions as usize {
            return false;
        }
        inner.reserved_slots.insert(key);
        debug!(
            symbol,
            side = %side,
            occupied = total + 1,
            cap = self.config.read().max_open_positions,
            "slot reserved"
        );
        true
    }

    /// Promote a reservation into an open position after the fill.
    #[allow(clippy::too_many_arguments)]
    pub fn confirm_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
        leverage: u32,
        tp_order_id: Option<String>,
        sl_order_id: Option<String>,
        stop_loss_price: f64,
        take_profit_price: f64,
    ) {
        let key = Self::key(symbol, side);
        let position = FuturesPosition {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price,
            leverage,
            stop_loss_price,
            take_profit_price,
            tp_order_id,
            sl_order_id,
            liquidation_price: Self::liquidation_price(side, entry_price, leverage),
            opened_at: Utc::now(),
        };
        let mut inner = self.state.lock();
        inner.reserved_slots.remove(&key);
        inner.open_positions.insert(key, position);
        info!(
            symbol,
            side = %side,
            quantity,
            entry_price,
            leverage,
            stop_loss_price,
            take_profit_price,
            "position confirmed"
        );
    }

    /// Drop a reservation after a failed open.
    pub fn release_slot(&self, symbol: &str, side: PositionSide) {
        let key = Self::key(symbol, side);
        self.state.lock().reserved_slots.remove(&key);
        debug!(symbol, side = %side, "slot released");
    }

    // -------------------------------------------------------------------------
    // Advisory metrics
    // -------------------------------------------------------------------------

    /// Pre-compute the futures risk picture ahead of the LLM call.
    #[allow(clippy::too_many_arguments)]
    pub fn pre_calculate_metrics(
        &self,
        signal: Signal,
        symbol: &str,
        side: PositionSide,
        price: f64,
        available_margin: f64,
        margin_ratio: f64,
        ohlcv: Option<&[Candle]>,
        horizon: Horizon,
    ) -> Option<RiskMetrics> {
        if !signal.is_open() {
            return None;
        }

        let reason = {
            let mut inner = self.state.lock();
            Self::reset_daily_pnl_if_needed(&mut inner);
            let key = Self::key(symbol, side);
            if margin_ratio >= self.config.read().max_margin_ratio {
                format!(
                    "margin ratio {:.1}% >= {:.0}%",
                    margin_ratio * 100.0,
                    self.config.read().max_margin_ratio * 100.0
                )
            } else if inner.daily_pnl < -(available_margin * self.config.read().max_daily_loss_pct) {
                format!(
                    "daily loss limit reached ({:.1}%)",
                    self.config.read().max_daily_loss_pct * 100.0
                )
            } else if inner.open_positions.len() + inner.reserved_slots.len()
                >= self.config.read().max_open_positions as usize
            {
                format!("max open positions reached ({})", self.config.read().max_open_positions)
            } else if inner.open_positions.contains_key(&key)
                || inner.reserved_slots.contains(&key)
            {
                format!("already holding {symbol} {side}")
            } else {
                String::new()
            }
        };

        let hp = self.horizon.read().params(horizon);
        let is_short = side == PositionSide::Short;
        let resolved = resolve_sl_tp(
            is_short,
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
        let mut reason = reason;
        if !passes_rr && reason.is_empty() {
            reason = format!("R:R {:.2} < {:.1} (horizon={horizon})", rr, hp.min_rr);
        }

        let atr_value = if self.config.read().atr.enabled {
            ohlcv
                .map(|c| crate::indicators::compute_atr(c, self.config.read().atr.period as usize))
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let leverage = self.config.read().leverage;
        let liq = Self::liquidation_price(side, price, leverage);
        let sl_pct = if price > 0.0 { resolved.sl_distance / price } else { 0.0 };
        let account_risk_pct = sl_pct * leverage as f64 * self.config.read().max_position_pct;

        let mut metrics = RiskMetrics {
            stop_loss_price: resolved.stop_loss,
            take_profit_price: resolved.take_profit,
            sl_distance: resolved.sl_distance,
            tp_distance: resolved.tp_distance,
            risk_reward_ratio: rr,
            atr_value,
            atr_used: atr_value > 0.0,
            leverage,
            liquidation_price: liq,
            account_risk_pct,
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

    /// Evaluate a futures signal. BUY opens long, SHORT opens short, SELL
    /// closes long, COVER closes short.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        signal: Signal,
        symbol: &str,
        price: f64,
        available_margin: f64,
        margin_ratio: f64,
        ohlcv: Option<&[Candle]>,
        horizon: Horizon,
        llm_size_pct: f64,
        llm_stop_loss: f64,
        llm_take_profit: f64,
    ) -> FuturesRiskOutput {
        let mut inner = self.state.lock();
        Self::reset_daily_pnl_if_needed(&mut inner);

        match signal {
            Signal::Buy => self.evaluate_open(
                &inner, symbol, PositionSide::Long, price, available_margin, margin_ratio,
                ohlcv, horizon, llm_size_pct, llm_stop_loss, llm_take_profit,
            ),
            Signal::Short => self.evaluate_open(
                &inner, symbol, PositionSide::Short, price, available_margin, margin_ratio,
                ohlcv, horizon, llm_size_pct, llm_stop_loss, llm_take_profit,
            ),
            Signal::Sell => Self::evaluate_close(&inner, symbol, PositionSide::Long, self.config.read().leverage),
            Signal::Cover => Self::evaluate_close(&inner, symbol, PositionSide::Short, self.config.read().leverage),
            Signal::Hold => FuturesRiskOutput::rejected("HOLD signal"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_open(
        &self,
        inner: &Inner,
        symbol: &str,
        side: PositionSide,
        price: f64,
        available_margin: f64,
        margin_ratio: f64,
        ohlcv: Option<&[Candle]>,
        horizon: Horizon,
        llm_size_pct: f64,
        llm_stop_loss: f64,
        llm_take_profit: f64,
    ) -> FuturesRiskOutput {
        // 1. Margin-ratio ceiling.
        if margin_ratio >= self.config.read().max_margin_ratio {
            let reason = format!(
                "margin ratio {:.1}% above ceiling {:.0}%",
                margin_ratio * 100.0,
                self.config.read().max_margin_ratio * 100.0
            );
            warn!(symbol, "{}", reason);
            return FuturesRiskOutput::rejected(reason);
        }

        // 2. Daily loss cap.
        if inner.daily_pnl < -(available_margin * self.config.read().max_daily_loss_pct) {
            let reason = format!(
                "daily loss limit reached ({:.1}%)",
                self.config.read().max_daily_loss_pct * 100.0
            );
            warn!(symbol, "{}", reason);
            return FuturesRiskOutput::rejected(reason);
        }

        // 3. Position cap counts reservations too.
        let total = inner.open_positions.len() + inner.reserved_slots.len();
        if total >= self.config.read().max_open_positions as usize {
            let reason = format!("max open positions reached ({})", self.config.read().max_open_positions);
            warn!(symbol, "{}", reason);
            return FuturesRiskOutput::rejected(reason);
        }

        // 4. Duplicate (symbol, side).
        let key = Self::key(symbol, side);
        if inner.open_positions.contains_key(&key) || inner.reserved_slots.contains(&key) {
            let reason = format!("already holding {symbol} {side}");
            info!("{}", reason);
            return FuturesRiskOutput::rejected(reason);
        }

        // 5. SL/TP resolution: LLM → ATR → fixed-%.
        let hp = self.horizon.read().params(horizon);
        let is_short = side == PositionSide::Short;
        let resolved = resolve_sl_tp(
            is_short,
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

        // 6. R:R floor.
        let risk_reward = if resolved.sl_distance > 0.0 {
            resolved.tp_distance / resolved.sl_distance
        } else {
            0.0
        };
        if risk_reward < hp.min_rr {
            let reason = format!(
                "R:R {:.2} below floor {:.1} (SL dist {:.2}, TP dist {:.2}, horizon={horizon})",
                risk_reward, hp.min_rr, resolved.sl_distance, resolved.tp_distance
            );
            warn!(symbol, "{}", reason);
            return FuturesRiskOutput::rejected(reason);
        }

        // 7. Account-risk cap: leverage amplifies the stop distance.
        let leverage = self.config.read().leverage;
        let sl_pct = resolved.sl_distance / price;
        let account_risk_pct = sl_pct * leverage as f64 * self.config.read().max_position_pct;
        let max_single_trade_risk = self.config.read().max_daily_loss_pct / 2.0;
        if account_risk_pct > max_single_trade_risk {
            let reason = format!(
                "single-trade account risk {:.2}% > {:.2}% (SL {:.2}% x {leverage}x x {:.1}%)",
                account_risk_pct * 100.0,
                max_single_trade_risk * 100.0,
                sl_pct * 100.0,
                self.config.read().max_position_pct * 100.0
            );
            warn!(symbol, "{}", reason);
            return FuturesRiskOutput::rejected(reason);
        }

        // 8. Stop must sit on the safe side of liquidation.
        let liq_price = Self::liquidation_price(side, price, leverage);
        let liquidation_breached = match side {
            PositionSide::Long => resolved.stop_loss <= liq_price,
            PositionSide::Short => resolved.stop_loss >= liq_price,
        };
        if liquidation_breached {
            let reason = format!(
                "stop {:.2} beyond liquidation price {:.2}",
                resolved.stop_loss, liq_price
            );
            warn!(symbol, "{}", reason);
            return FuturesRiskOutput::rejected(reason);
        }

        // 9. Leverage-aware sizing, horizon-scaled, LLM-capped.
        let mut notional =
            available_margin * self.config.read().max_position_pct * leverage as f64 * hp.size_factor;
        if llm_size_pct > 0.0 {
            notional = notional.min(available_margin * llm_size_pct * leverage as f64);
        }
        let quantity = notional / price;
        if quantity <= 0.0 {
            return FuturesRiskOutput::rejected("computed quantity is zero");
        }

        info!(
            symbol,
            side = %side,
            quantity,
            leverage,
            stop_loss = resolved.stop_loss,
            take_profit = resolved.take_profit,
            risk_reward,
            liquidation = liq_price,
            account_risk_pct = account_risk_pct * 100.0,
            horizon = %horizon,
            "risk approved open"
        );

        FuturesRiskOutput {
            approved: true,
            quantity,
            stop_loss_price: resolved.stop_loss,
            take_profit_price: resolved.take_profit,
            leverage,
            liquidation_price: liq_price,
            risk_reward_ratio: risk_reward,
            reason: String::new(),
        }
    }

    fn evaluate_close(
        inner: &Inner,
        symbol: &str,
        side: PositionSide,
        default_leverage: u32,
    ) -> FuturesRiskOutput {
        let key = Self::key(symbol, side);
        let Some(position) = inner.open_positions.get(&key) else {
            let reason = format!("no {side} position in {symbol} to close");
            info!("{}", reason);
            return FuturesRiskOutput::rejected(reason);
        };

        info!(symbol, side = %side, quantity = position.quantity, "risk approved close");
        FuturesRiskOutput {
            approved: true,
            quantity: position.quantity,
            leverage: if position.leverage >= 1 { position.leverage } else { default_leverage },
            ..Default::default()
        }
    }

    // -------------------------------------------------------------------------
    // Position tracking
    // -------------------------------------------------------------------------

    /// Record a position directly (restore / reconciliation adoption). Any
    /// matching reservation is consumed.
    #[allow(clippy::too_many_arguments)]
    pub fn add_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
        leverage: u32,
        tp_order_id: Option<String>,
        sl_order_id: Option<String>,
        stop_loss_price: f64,
        take_profit_price: f64,
    ) {
        self.confirm_position(
            symbol,
            side,
            quantity,
            entry_price,
            leverage,
            tp_order_id,
            sl_order_id,
            stop_loss_price,
            take_profit_price,
        );
    }

    /// Remove a position at `exit_price` and book the realised PnL.
    pub fn remove_position(&self, symbol: &str, side: PositionSide, exit_price: f64) -> f64 {
        let key = Self::key(symbol, side);
        let mut inner = self.state.lock();
        let Some(position) = inner.open_positions.remove(&key) else {
            return 0.0;
        };
        let pnl = match side {
            PositionSide::Long => (exit_price - position.entry_price) * position.quantity,
            PositionSide::Short => (position.entry_price - exit_price) * position.quantity,
        };
        inner.daily_pnl += pnl;
        info!(
            symbol,
            side = %side,
            pnl,
            entry = position.entry_price,
            exit = exit_price,
            "position removed"
        );
        pnl
    }

    /// Remove without touching PnL (reconciliation of phantoms).
    pub fn force_remove_position(&self, symbol: &str, side: PositionSide) {
        let key = Self::key(symbol, side);
        let removed = self.state.lock().open_positions.remove(&key);
        if let Some(p) = removed {
            warn!(
                symbol,
                side = %side,
                entry = p.entry_price,
                quantity = p.quantity,
                "phantom position force-removed"
            );
        }
    }

    /// Price-poll SL/TP check. Stored prices win; restored positions without
    /// them fall back to fixed percentages around entry.
    pub fn check_stop_loss_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        current_price: f64,
    ) -> Signal {
        let (entry, mut stop_loss, mut take_profit) = {
            let inner = self.state.lock();
            let Some(p) = inner.open_positions.get(&Self::key(symbol, side)) else {
                return Signal::Hold;
            };
            (p.entry_price, p.stop_loss_price, p.take_profit_price)
        };

        if stop_loss <= 0.0 || take_profit <= 0.0 {
            match side {
                PositionSide::Long => {
                    stop_loss = entry * (1.0 - self.config.read().stop_loss_pct);
                    take_profit = entry * (1.0 + self.config.read().take_profit_pct);
                }
                PositionSide::Short => {
                    stop_loss = entry * (1.0 + self.config.read().stop_loss_pct);
                    take_profit = entry * (1.0 - self.config.read().take_profit_pct);
                }
            }
        }

        match side {
            PositionSide::Long => {
                if current_price <= stop_loss {
                    warn!(symbol, current_price, stop_loss, "long stop-loss triggered");
                    return Signal::Sell;
                }
                if current_price >= take_profit {
                    info!(symbol, current_price, take_profit, "long take-profit triggered");
                    return Signal::Sell;
                }
            }
            PositionSide::Short => {
                if current_price >= stop_loss {
                    warn!(symbol, current_price, stop_loss, "short stop-loss triggered");
                    return Signal::Cover;
                }
                if current_price <= take_profit {
                    info!(symbol, current_price, take_profit, "short take-profit triggered");
                    return Signal::Cover;
                }
            }
        }
        Signal::Hold
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_position_count(&self) -> usize {
        self.state.lock().open_positions.len()
    }

    pub fn get_position(&self, symbol: &str, side: PositionSide) -> Option<FuturesPosition> {
        self.state
            .lock()
            .open_positions
            .get(&Self::key(symbol, side))
            .cloned()
    }

    pub fn get_all_positions(&self) -> Vec<FuturesPosition> {
        self.state.lock().open_positions.values().cloned().collect()
    }

    pub fn get_sl_tp_order_ids(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> (Option<String>, Option<String>) {
        let inner = self.state.lock();
        match inner.open_positions.get(&Self::key(symbol, side)) {
            Some(p) => (p.tp_order_id.clone(), p.sl_order_id.clone()),
            None => (None, None),
        }
    }

    pub fn has_exchange_sl_tp(&self, symbol: &str, side: PositionSide) -> bool {
        let (tp, sl) = self.get_sl_tp_order_ids(symbol, side);
        tp.is_some() || sl.is_some()
    }

    pub fn daily_pnl(&self) -> f64 {
        self.state.lock().daily_pnl
    }

    pub fn leverage(&self) -> u32 {
        self.config.read().leverage
    }
}

impl std::fmt::Debug for FuturesRiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.state.lock();
        f.debug_struct("FuturesRiskManager")
            .field("open_positions", &inner.open_positions.len())
            .field("reserved_slots", &inner.reserved_slots.len())
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
    use std::sync::Arc;

    fn manager_with(yaml: &str) -> FuturesRiskManager {
        let config: FuturesConfig = serde_yaml::from_str(yaml).unwrap();
        FuturesRiskManager::new(config, HorizonRiskConfig::default())
    }

    fn manager() -> FuturesRiskManager {
        manager_with("{}")
    }

    fn candles(n: usize, price: f64, range: f64) -> Vec<Candle> {
        (0..n)
            .map(|_| Candle {
                open_time: 0,
                open: price,
                high: price + range,
                low: price - range,
                close: price,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn scenario_liquidation_guard_rejects() {
        // leverage 10, price 100, llm_sl 85 → liq = 100 × (1 − 0.1 + 0.004)
        // = 90.4; sl 85 < 90.4 → rejected.
        let m = manager_with("leverage: 10\nmax_leverage: 10\nmax_daily_loss_pct: 0.5\nmax_position_pct: 0.005\n");
        let out = m.evaluate(
            Signal::Buy, "BTC/USDT", 100.0, 10_000.0, 0.0, None,
            Horizon::Medium, 0.0, 85.0, 130.0,
        );
        assert!(!out.approved);
        assert!(out.reason.contains("liquidation"), "{}", out.reason);
    }

    #[test]
    fn scenario_atr_rr_pass_and_fixed_rr_fail() {
        // ATR=1 (range 0.5), medium multipliers 1.5/3.0 → R:R exactly 2.0: pass.
        let m = manager_with("leverage: 3\n");
        let c = candles(30, 100.0, 0.5);
        let out = m.evaluate(
            Signal::Buy, "ETH/USDT", 100.0, 10_000.0, 0.0, Some(&c),
            Horizon::Medium, 0.0, 0.0, 0.0,
        );
        assert!(out.approved, "{}", out.reason);
        assert!((out.risk_reward_ratio - 2.0).abs() < 1e-9);

        // No ATR data and fixed percentages 0.03/0.04 → R:R 1.33 < 2.0: reject.
        let m2 = manager_with(
            "leverage: 3\natr:\n  enabled: false\nstop_loss_pct: 0.03\ntake_profit_pct: 0.04\n",
        );
        // Rewire horizon fixed pcts to the config under test.
        let mut hr = HorizonRiskConfig::default();
        hr.medium_sl_pct = 0.03;
        hr.medium_tp_pct = 0.04;
        let m2 = FuturesRiskManager::new(m2.config.into_inner(), hr);
        let out = m2.evaluate(
            Signal::Buy, "ETH/USDT", 100.0, 10_000.0, 0.0, None,
            Horizon::Medium, 0.0, 0.0, 0.0,
        );
        assert!(!out.approved);
        assert!(out.reason.contains("R:R"), "{}", out.reason);
    }

    #[test]
    fn margin_ratio_gate() {
        let m = manager();
        let out = m.evaluate(
            Signal::Buy, "BTC/USDT", 100.0, 10_000.0, 0.85, None,
            Horizon::Medium, 0.0, 0.0, 0.0,
        );
        assert!(!out.approved);
        assert!(out.reason.contains("margin ratio"));
    }

    #[test]
    fn account_risk_gate() {
        // SL 10% × 5x × 20% position = 10% account risk > 2.5% cap.
        let m = manager_with("leverage: 5\nmax_leverage: 5\nmax_position_pct: 0.2\n");
        let out = m.evaluate(
            Signal::Buy, "BTC/USDT", 100.0, 10_000.0, 0.0, None,
            Horizon::Medium, 0.0, 90.0, 130.0,
        );
        assert!(!out.approved);
        assert!(out.reason.contains("account risk"), "{}", out.reason);
    }

    #[test]
    fn approved_open_invariants() {
        // Properties 4/5/6 on an approved open.
        let m = manager();
        let out = m.evaluate(
            Signal::Buy, "BTC/USDT", 100.0, 10_000.0, 0.0, None,
            Horizon::Medium, 0.0, 0.0, 0.0,
        );
        assert!(out.approved, "{}", out.reason);

        let sl_dist = 100.0 - out.stop_loss_price;
        let tp_dist = out.take_profit_price - 100.0;
        assert!(tp_dist / sl_dist >= 2.0 - 1e-9);

        let liq = FuturesRiskManager::liquidation_price(PositionSide::Long, 100.0, out.leverage);
        assert!(out.stop_loss_price > liq);

        let account_risk = (sl_dist / 100.0) * out.leverage as f64 * 0.02;
        assert!(account_risk <= 0.05 / 2.0 + 1e-12);
    }

    #[test]
    fn short_open_and_close() {
        let m = manager();
        let out = m.evaluate(
            Signal::Short, "SOL/USDT", 100.0, 10_000.0, 0.0, None,
            Horizon::Short, 0.0, 0.0, 0.0,
        );
        assert!(out.approved, "{}", out.reason);
        assert!(out.stop_loss_price > 100.0);
        assert!(out.take_profit_price < 100.0);

        m.confirm_position(
            "SOL/USDT", PositionSide::Short, out.quantity, 100.0, out.leverage,
            None, None, out.stop_loss_price, out.take_profit_price,
        );

        let close = m.evaluate(
            Signal::Cover, "SOL/USDT", 95.0, 0.0, 0.0, None,
            Horizon::Medium, 0.0, 0.0, 0.0,
        );
        assert!(close.approved);
        assert!((close.quantity - out.quantity).abs() < 1e-12);

        let pnl = m.remove_position("SOL/USDT", PositionSide::Short, 95.0);
        assert!(pnl > 0.0);
    }

    #[test]
    fn close_without_position_rejected() {
        let m = manager();
        let out = m.evaluate(
            Signal::Sell, "BTC/USDT", 100.0, 0.0, 0.0, None,
            Horizon::Medium, 0.0, 0.0, 0.0,
        );
        assert!(!out.approved);
    }

    #[test]
    fn slot_reservation_counts_toward_cap() {
        let m = manager(); // cap 3
        assert!(m.reserve_slot("A/USDT", PositionSide::Long));
        assert!(m.reserve_slot("B/USDT", PositionSide::Long));
        m.confirm_position("C/USDT", PositionSide::Short, 1.0, 100.0, 3, None, None, 95.0, 110.0);

        // 2 reserved + 1 open = cap.
        assert!(!m.reserve_slot("D/USDT", PositionSide::Long));
        let out = m.evaluate(
            Signal::Buy, "D/USDT", 100.0, 10_000.0, 0.0, None,
            Horizon::Medium, 0.0, 0.0, 0.0,
        );
        assert!(!out.approved);
        assert!(out.reason.contains("max open positions"));

        // Releasing a slot frees capacity.
        m.release_slot("A/USDT", PositionSide::Long);
        assert!(m.reserve_slot("D/USDT", PositionSide::Long));
    }

    #[test]
    fn duplicate_reservation_rejected() {
        let m = manager();
        assert!(m.reserve_slot("BTC/USDT", PositionSide::Long));
        assert!(!m.reserve_slot("BTC/USDT", PositionSide::Long));
        // Opposite side is a distinct slot.
        assert!(m.reserve_slot("BTC/USDT", PositionSide::Short));
    }

    #[test]
    fn concurrent_reservation_is_exclusive() {
        // Property 8: exactly one of two racing reserves wins.
        let m = Arc::new(manager());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                m.reserve_slot("BTC/USDT", PositionSide::Long)
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn sl_tp_poll_short_side() {
        let m = manager();
        m.confirm_position(
            "BTC/USDT", PositionSide::Short, 0.01, 100.0, 3, None, None, 103.0, 94.0,
        );
        assert_eq!(
            m.check_stop_loss_take_profit("BTC/USDT", PositionSide::Short, 100.0),
            Signal::Hold
        );
        assert_eq!(
            m.check_stop_loss_take_profit("BTC/USDT", PositionSide::Short, 103.5),
            Signal::Cover
        );
        assert_eq!(
            m.check_stop_loss_take_profit("BTC/USDT", PositionSide::Short, 93.0),
            Signal::Cover
        );
    }

    #[test]
    fn pre_metrics_flags_rr_failure() {
        let mut hr = HorizonRiskConfig::default();
        hr.medium_sl_pct = 0.03;
        hr.medium_tp_pct = 0.04;
        let config: FuturesConfig = serde_yaml::from_str("atr:\n  enabled: false\n").unwrap();
        let m = FuturesRiskManager::new(config, hr);
        let metrics = m
            .pre_calculate_metrics(
                Signal::Buy, "BTC/USDT", PositionSide::Long, 100.0, 10_000.0, 0.0, None,
                Horizon::Medium,
            )
            .unwrap();
        assert!(!metrics.passes_min_rr);
        assert!(metrics.reason.contains("R:R"));
        assert!((metrics.liquidation_price - 100.0 * (1.0 - 1.0 / 3.0 + 0.004)).abs() < 1e-9);
    }
}
