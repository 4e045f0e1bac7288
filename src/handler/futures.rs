// =============================================================================
// Futures handler — per-symbol pipeline with signal translation and slot
// reservation
// =============================================================================
//
// Raw decision vs current position state:
//
//   | raw    | no position | has long   | has short   |
//   |--------|-------------|------------|-------------|
//   | BUY    | open long   | HOLD       | close short |
//   | SELL   | open short  | close long | HOLD        |
//   | SHORT  | open short  | HOLD       | HOLD        |
//   | COVER  | HOLD        | HOLD       | close short |
//
// Opens run through reserve_slot → execute → confirm_position, with
// release_slot on any failure in between.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{timeframe_minutes, Settings};
use crate::data::fetcher::DataFetcher;
use crate::data::models::Candle;
use crate::exchange::futures::FuturesClient;
use crate::execution::futures::FuturesExecutor;
use crate::handler::spot::build_mtf_summaries;
use crate::handler::{current_slot, finest_timeframe_minutes, format_hold_duration};
use crate::llm::engine::LlmDecisionEngine;
use crate::llm::schemas::{DecisionResult, PortfolioState, PositionInfo};
use crate::risk::futures::FuturesRiskManager;
use crate::sink::Sink;
use crate::strategy::{router::Router, Strategy};
use crate::types::{Horizon, PositionSide, Signal};

pub struct FuturesHandler {
    exchange: Arc<FuturesClient>,
    fetcher: Arc<DataFetcher>,
    risk: Arc<FuturesRiskManager>,
    executor: FuturesExecutor,
    sink: Arc<Sink>,

    last_strategy_slot: HashMap<String, i64>,
    cooldown_until: HashMap<String, DateTime<Utc>>,
}

impl FuturesHandler {
    pub fn new(
        exchange: Arc<FuturesClient>,
        fetcher: Arc<DataFetcher>,
        risk: Arc<FuturesRiskManager>,
        executor: FuturesExecutor,
        sink: Arc<Sink>,
    ) -> Self {
        Self {
            exchange,
            fetcher,
            risk,
            executor,
            sink,
            last_strategy_slot: HashMap::new(),
            cooldown_until: HashMap::new(),
        }
    }

    pub fn clear_slot_memo(&mut self) {
        self.last_strategy_slot.clear();
    }

    /// Process one futures symbol for one cycle.
    pub async fn process_symbol(
        &mut self,
        settings: &Settings,
        llm: &LlmDecisionEngine,
        symbol: &str,
        cycle_id: &str,
        strategies: &mut [Strategy],
    ) -> Result<()> {
        let fc = &settings.futures;

        if let Err(e) = self.exchange.ensure_leverage_and_margin(symbol).await {
            warn!(symbol, error = %e, "leverage/margin setup failed");
        }

        // ── 1. Slot guard on the finest OHLCV timeframe ──────────────────
        let finest_minutes = finest_timeframe_minutes(strategies);
        let slot = current_slot(finest_minutes, Utc::now());
        if self.last_strategy_slot.get(symbol) == Some(&slot) {
            return Ok(());
        }
        self.last_strategy_slot.insert(symbol.to_string(), slot);

        // ── 2. Grouped OHLCV fetch ───────────────────────────────────────
        let tf_dataframes = self.fetch_timeframes(fc, symbol, strategies).await;
        if tf_dataframes.is_empty() {
            warn!(symbol, "no futures OHLCV data — skipping symbol");
            return Ok(());
        }

        let finest_tf = tf_dataframes
            .keys()
            .min_by_key(|tf| timeframe_minutes(tf).unwrap_or(u32::MAX))
            .cloned()
            .unwrap_or_default();
        let finest_df = tf_dataframes[&finest_tf].clone();
        let Some(current_price) = finest_df.last().map(|c| c.close) else {
            return Ok(());
        };
        info!(symbol, price = current_price, "futures price");

        // ── 3. Protective-order check, both sides ────────────────────────
        for side in [PositionSide::Long, PositionSide::Short] {
            if self.risk.get_position(symbol, side).is_none() {
                continue;
            }
            if self.executor.is_live()
                && self.risk.has_exchange_sl_tp(symbol, side)
                && self.sync_sl_tp(settings, symbol, side).await
            {
                continue;
            }
            if !self.risk.has_exchange_sl_tp(symbol, side) {
                let triggered = self.risk.check_stop_loss_take_profit(symbol, side, current_price);
                if triggered.is_close() {
                    let close_side = if triggered == Signal::Sell {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    };
                    info!(symbol, side = %close_side, "stored SL/TP triggered — closing");
                    self.execute_close(settings, symbol, close_side, current_price, cycle_id)
                        .await;
                }
            }
        }

        // ── 4. Strategy fan-out ──────────────────────────────────────────
        let mut router = Router::new();
        for strategy in strategies.iter_mut() {
            let verdict = match strategy {
                Strategy::Ohlcv(s) => {
                    let tf = s.timeframe().to_string();
                    match tf_dataframes.get(&tf) {
                        Some(df) if df.len() >= s.required_candles() => {
                            Some(s.generate_verdict(df))
                        }
                        _ => None,
                    }
                }
                // Futures shares the spot handler's order-flow ingestion; it
                // only consumes the memoized verdict here.
                Strategy::OrderFlow(s) => s.latest_verdict(symbol),
            };

            if let Some(verdict) = verdict {
                self.sink
                    .insert_verdict(
                        symbol,
                        &verdict.strategy_name,
                        verdict.signal.as_str(),
                        verdict.confidence,
                        &verdict.reasoning,
                        cycle_id,
                        "futures",
                        &verdict.timeframe,
                    )
                    .await;
                info!(
                    strategy = %verdict.strategy_name,
                    timeframe = %if verdict.timeframe.is_empty() { "of" } else { verdict.timeframe.as_str() },
                    signal = %verdict.signal,
                    confidence = verdict.confidence,
                    "futures verdict"
                );
                router.collect(verdict);
            }
        }

        let verdicts = router.get_verdicts();
        if verdicts.is_empty() {
            return Ok(());
        }

        // ── 5. Pre-compute advisory risk metrics ─────────────────────────
        let primary_signal = verdicts
            .iter()
            .find(|v| v.signal != Signal::Hold)
            .map(|v| v.signal);
        let risk_metrics = match primary_signal {
            Some(signal @ (Signal::Buy | Signal::Short)) => {
                let side = if signal == Signal::Buy {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                match self.account_state().await {
                    Ok((available, margin_ratio)) => self.risk.pre_calculate_metrics(
                        signal,
                        symbol,
                        side,
                        current_price,
                        available,
                        margin_ratio,
                        Some(&finest_df),
                        Horizon::Medium,
                    ),
                    Err(e) => {
                        warn!(symbol, error = %e, "risk pre-calc skipped: account unavailable");
                        None
                    }
                }
            }
            _ => None,
        };

        // ── 6. MTF summary + LLM gate ────────────────────────────────────
        let mtf_summaries = build_mtf_summaries(settings, &tf_dataframes);
        let portfolio = self.build_portfolio_state(settings, symbol, current_price).await;
        let decision = llm
            .make_decision(
                &verdicts,
                &portfolio,
                symbol,
                current_price,
                "futures",
                risk_metrics.as_ref(),
                &mtf_summaries,
            )
            .await;
        self.sink
            .insert_llm_decision(
                symbol,
                decision.signal.as_str(),
                decision.confidence,
                &decision.reasoning,
                llm.model(),
                cycle_id,
                "futures",
            )
            .await;

        if decision.signal == Signal::Hold {
            info!(symbol, "decision: HOLD");
            return Ok(());
        }
        if decision.confidence < fc.min_confidence {
            info!(
                symbol,
                signal = %decision.signal,
                confidence = decision.confidence,
                floor = fc.min_confidence,
                "confidence below floor — HOLD"
            );
            return Ok(());
        }

        // ── 7. Signal translation against current position state ─────────
        let translated = self.translate_signal(decision.signal, symbol);
        if translated == Signal::Hold {
            return Ok(());
        }
        info!(
            symbol,
            raw = %decision.signal,
            translated = %translated,
            confidence = decision.confidence,
            horizon = %decision.horizon,
            "futures decision"
        );

        // ── 8. Guards + risk + execution ─────────────────────────────────
        match translated {
            Signal::Buy | Signal::Short => {
                if self.is_in_cooldown(symbol) {
                    return Ok(());
                }
                self.execute_open(settings, symbol, translated, current_price, cycle_id, &decision, &finest_df)
                    .await;
            }
            Signal::Sell => {
                self.execute_close(settings, symbol, PositionSide::Long, current_price, cycle_id)
                    .await;
            }
            Signal::Cover => {
                self.execute_close(settings, symbol, PositionSide::Short, current_price, cycle_id)
                    .await;
            }
            Signal::Hold => {}
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Signal translation
    // -------------------------------------------------------------------------

    /// Map the decision's raw action onto the long/short state machine.
    fn translate_signal(&self, signal: Signal, symbol: &str) -> Signal {
        let has_long = self.risk.get_position(symbol, PositionSide::Long).is_some();
        let has_short = self.risk.get_position(symbol, PositionSide::Short).is_some();

        match signal {
            Signal::Sell => {
                if has_long {
                    Signal::Sell
                } else if has_short {
                    info!(symbol, "SELL with short open — HOLD");
                    Signal::Hold
                } else {
                    Signal::Short
                }
            }
            Signal::Buy => {
                if has_short {
                    Signal::Cover
                } else if has_long {
                    info!(symbol, "BUY with long open — HOLD");
                    Signal::Hold
                } else {
                    Signal::Buy
                }
            }
            Signal::Short => {
                if has_short || has_long {
                    info!(symbol, "SHORT with position open — HOLD");
                    Signal::Hold
                } else {
                    Signal::Short
                }
            }
            Signal::Cover => {
                if has_short {
                    Signal::Cover
                } else {
                    info!(symbol, "COVER without short — HOLD");
                    Signal::Hold
                }
            }
            Signal::Hold => Signal::Hold,
        }
    }

    // -------------------------------------------------------------------------
    // Fetch / account helpers
    // -------------------------------------------------------------------------

    async fn fetch_timeframes(
        &self,
        fc: &crate::config::FuturesConfig,
        symbol: &str,
        strategies: &[Strategy],
    ) -> HashMap<String, Vec<Candle>> {
        let mut tf_required: HashMap<String, usize> = HashMap::new();
        for strategy in strategies {
            if let Strategy::Ohlcv(s) = strategy {
                let tf = if s.timeframe().is_empty() {
                    fc.timeframe.clone()
                } else {
                    s.timeframe().to_string()
                };
                let entry = tf_required.entry(tf).or_insert(0);
                *entry = (*entry).max(s.required_candles());
            }
        }

        let mut out = HashMap::new();
        for (tf, max_required) in tf_required {
            let limit = ((max_required + 10).max(100)) as u32;
            match self
                .fetcher
                .fetch_ohlcv(symbol, &tf, limit, Duration::from_secs(30))
                .await
            {
                Ok(candles) if !candles.is_empty() => {
                    out.insert(tf, candles);
                }
                Ok(_) => {}
                Err(e) => warn!(symbol, timeframe = %tf, error = %e, "futures OHLCV fetch failed"),
            }
        }
        out
    }

    async fn account_state(&self) -> Result<(f64, f64)> {
        let balance = self.exchange.get_futures_balance().await?;
        let margin_ratio = self.exchange.get_margin_ratio().await?;
        Ok((balance.available_balance, margin_ratio))
    }

    // -------------------------------------------------------------------------
    // Execution paths
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn execute_open(
        &mut self,
        settings: &Settings,
        symbol: &str,
        signal: Signal,
        price: f64,
        cycle_id: &str,
        decision: &DecisionResult,
        ohlcv: &[Candle],
    ) {
        let fc = &settings.futures;
        let side = if signal == Signal::Buy {
            PositionSide::Long
        } else {
            PositionSide::Short
        };

        let (available, margin_ratio) = match self.account_state().await {
            Ok(v) => v,
            Err(e) => {
                warn!(symbol, error = %e, "margin state unavailable — open skipped");
                return;
            }
        };

        // Advisory: flag entries that would pay an elevated funding rate
        // (longs pay when positive, shorts pay when negative).
        if let Ok(rate) = self.exchange.get_funding_rate(symbol).await {
            let pays = (side == PositionSide::Long && rate > 0.0)
                || (side == PositionSide::Short && rate < 0.0);
            if pays && rate.abs() >= fc.funding_rate_threshold {
                warn!(
                    symbol,
                    side = %side,
                    funding_rate = rate,
                    threshold = fc.funding_rate_threshold,
                    "entry pays an elevated funding rate"
                );
            }
        }

        let mut risk_output = self.risk.evaluate(
            signal,
            symbol,
            price,
            available,
            margin_ratio,
            Some(ohlcv),
            decision.horizon,
            decision.llm_size_pct,
            decision.stop_loss,
            decision.take_profit,
        );
        if !risk_output.approved {
            info!(symbol, reason = %risk_output.reason, "risk rejected open");
            return;
        }

        if decision.llm_override && risk_output.quantity > 0.0 {
            risk_output.quantity /= 2.0;
            info!(symbol, quantity = risk_output.quantity, "override — half size");
        }

        // Slot is held from here until fill confirmation or failure.
        if !self.risk.reserve_slot(symbol, side) {
            info!(symbol, side = %side, "slot unavailable — open skipped");
            return;
        }

        let Some(order) = self.executor.execute(signal, symbol, &risk_output).await else {
            self.risk.release_slot(symbol, side);
            return;
        };
        let fill_price = order["price"].as_f64().unwrap_or(price);
        let leverage = risk_output.leverage.max(1);

        let mut tp_order_id = None;
        let mut sl_order_id = None;
        if let Some(placed) = self
            .executor
            .place_sl_tp(
                symbol,
                risk_output.quantity,
                side,
                risk_output.take_profit_price,
                risk_output.stop_loss_price,
            )
            .await
        {
            tp_order_id = placed["tp_order_id"].as_str().map(|s| s.to_string());
            sl_order_id = placed["sl_order_id"].as_str().map(|s| s.to_string());
        }

        self.risk.confirm_position(
            symbol,
            side,
            risk_output.quantity,
            fill_price,
            leverage,
            tp_order_id,
            sl_order_id,
            risk_output.stop_loss_price,
            risk_output.take_profit_price,
        );

        let mode = fc.mode.as_str();
        self.sink
            .insert_order(&order, mode, cycle_id, "futures", Some(side.as_str()), leverage, false)
            .await;
        self.sink
            .upsert_position(
                symbol,
                serde_json::json!({
                    "side": side.as_str(),
                    "leverage": leverage,
                    "quantity": risk_output.quantity,
                    "entry_price": fill_price,
                    "current_price": fill_price,
                    "unrealized_pnl": 0,
                    "stop_loss": risk_output.stop_loss_price,
                    "take_profit": risk_output.take_profit_price,
                    "liquidation_price": risk_output.liquidation_price,
                    "margin_type": fc.margin_type,
                }),
                mode,
                "futures",
            )
            .await;

        info!(
            symbol,
            side = %side,
            fill_price,
            quantity = risk_output.quantity,
            leverage,
            stop_loss = risk_output.stop_loss_price,
            take_profit = risk_output.take_profit_price,
            liquidation = risk_output.liquidation_price,
            "open complete"
        );
    }

    async fn execute_close(
        &mut self,
        settings: &Settings,
        symbol: &str,
        side: PositionSide,
        price: f64,
        cycle_id: &str,
    ) {
        let fc = &settings.futures;
        let close_signal = side.close_signal();

        let (tp_id, sl_id) = self.risk.get_sl_tp_order_ids(symbol, side);
        if tp_id.is_some() || sl_id.is_some() {
            self.executor
                .cancel_sl_tp(symbol, tp_id.as_deref(), sl_id.as_deref())
                .await;
        }

        let risk_output = self.risk.evaluate(
            close_signal,
            symbol,
            price,
            0.0,
            0.0,
            None,
            Horizon::Medium,
            0.0,
            0.0,
            0.0,
        );
        if !risk_output.approved {
            return;
        }

        let Some(order) = self.executor.execute(close_signal, symbol, &risk_output).await else {
            return;
        };
        let fill_price = order["price"].as_f64().unwrap_or(price);
        let pnl = self.risk.remove_position(symbol, side, fill_price);

        let mode = fc.mode.as_str();
        self.sink
            .insert_order(
                &order,
                mode,
                cycle_id,
                "futures",
                Some(side.as_str()),
                risk_output.leverage,
                true,
            )
            .await;
        self.sink
            .delete_position(symbol, mode, "futures", side.as_str())
            .await;

        info!(symbol, side = %side, fill_price, pnl, "close complete");
        self.set_cooldown(settings, symbol);
    }

    /// Poll resting SL/TP orders for one side; a fill closes the position.
    async fn sync_sl_tp(&mut self, settings: &Settings, symbol: &str, side: PositionSide) -> bool {
        let (tp_id, sl_id) = self.risk.get_sl_tp_order_ids(symbol, side);
        for (order_id, label) in [(tp_id, "take-profit"), (sl_id, "stop-loss")] {
            let Some(order_id) = order_id else { continue };
            match self.executor.order_status(&order_id, symbol).await {
                Ok(status) if status["status"] == "closed" => {
                    let fill_price = status["price"].as_f64().unwrap_or(0.0);
                    let pnl = self.risk.remove_position(symbol, side, fill_price);
                    self.sink
                        .delete_position(
                            symbol,
                            settings.futures.mode.as_str(),
                            "futures",
                            side.as_str(),
                        )
                        .await;
                    info!(
                        symbol,
                        side = %side,
                        label,
                        fill_price,
                        pnl,
                        "exchange protective order filled"
                    );
                    self.set_cooldown(settings, symbol);
                    return true;
                }
                Ok(_) => {}
                Err(e) => debug!(symbol, order_id, error = %e, "SL/TP status query failed"),
            }
        }
        false
    }

    // -------------------------------------------------------------------------
    // Margin snapshot
    // -------------------------------------------------------------------------

    /// Persist a margin-account snapshot (called once per cycle).
    pub async fn record_margin(&self) -> Result<()> {
        let balance = self.exchange.get_futures_balance().await?;
        let margin_ratio = self.exchange.get_margin_ratio().await?;
        self.sink
            .insert_futures_margin(
                balance.total_wallet_balance,
                balance.available_balance,
                balance.total_unrealized_pnl,
                balance.total_margin_balance,
                margin_ratio,
            )
            .await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Guards
    // -------------------------------------------------------------------------

    fn set_cooldown(&mut self, settings: &Settings, symbol: &str) {
        let minutes = settings.futures.cooldown_minutes;
        if minutes > 0 {
            let until = Utc::now() + chrono::Duration::minutes(minutes);
            self.cooldown_until.insert(symbol.to_string(), until);
            info!(symbol, minutes, "cooldown started");
        }
    }

    fn is_in_cooldown(&mut self, symbol: &str) -> bool {
        let Some(until) = self.cooldown_until.get(symbol).copied() else {
            return false;
        };
        let now = Utc::now();
        if now >= until {
            self.cooldown_until.remove(symbol);
            return false;
        }
        info!(
            symbol,
            remaining_min = (until - now).num_minutes(),
            "in cooldown — no new entry"
        );
        true
    }

    // -------------------------------------------------------------------------
    // Portfolio snapshot
    // -------------------------------------------------------------------------

    async fn build_portfolio_state(
        &self,
        settings: &Settings,
        symbol: &str,
        current_price: f64,
    ) -> PortfolioState {
        let (available, margin_balance, margin_ratio) =
            match self.exchange.get_futures_balance().await {
                Ok(b) => {
                    let ratio = self.exchange.get_margin_ratio().await.unwrap_or(0.0);
                    (b.available_balance, b.total_margin_balance, ratio)
                }
                Err(_) => (0.0, 0.0, 0.0),
            };

        let open_positions = self.risk.get_all_positions();
        let daily_pnl = self.risk.daily_pnl();
        let count = open_positions.len() as u32;

        let mut positions = Vec::with_capacity(open_positions.len());
        for p in open_positions {
            let price = if p.symbol == symbol { current_price } else { p.entry_price };
            let pnl = match p.side {
                PositionSide::Long => (price - p.entry_price) * p.quantity,
                PositionSide::Short => (p.entry_price - price) * p.quantity,
            };
            let basis = p.entry_price * p.quantity;
            let held_min = (Utc::now() - p.opened_at).num_minutes();
            positions.push(PositionInfo {
                symbol: p.symbol.clone(),
                quantity: p.quantity,
                entry_price: p.entry_price,
                current_price: price,
                unrealized_pnl: pnl,
                unrealized_pnl_pct: if basis > 0.0 { pnl / basis } else { 0.0 },
                holding_duration: format_hold_duration(held_min),
                side: p.side.as_str().to_string(),
                leverage: p.leverage,
                liquidation_price: Some(p.liquidation_price),
                entry_horizon: String::new(),
                entry_reasoning: String::new(),
            });
        }

        let fc = &settings.futures;
        PortfolioState {
            available_balance: available,
            positions,
            max_positions: fc.max_open_positions,
            current_position_count: count,
            daily_realized_pnl: daily_pnl,
            daily_risk_remaining: available * fc.max_daily_loss_pct + daily_pnl,
            margin_balance,
            margin_ratio,
            leverage: fc.leverage,
        }
    }
}
