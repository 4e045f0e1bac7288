// =============================================================================
// Spot handler — the per-symbol pipeline for one cycle
// =============================================================================
//
// Order of operations per invocation:
//   order-flow ingestion (every cycle) → slot guard → grouped OHLCV fetch →
//   protective-order check → strategy fan-out → risk pre-calc → MTF summary →
//   LLM decision → confidence floor → cooldown / minimum-hold guards → risk
//   evaluation → execution → persistence.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{timeframe_minutes, Settings};
use crate::data::bar_aggregator::BarAggregator;
use crate::data::fetcher::DataFetcher;
use crate::data::models::Candle;
use crate::exchange::spot::SpotClient;
use crate::execution::spot::SpotExecutor;
use crate::handler::{current_slot, finest_timeframe_minutes, format_hold_duration};
use crate::indicators::{compute_timeframe_summary, TimeframeSummary};
use crate::llm::engine::LlmDecisionEngine;
use crate::llm::schemas::{DecisionResult, PortfolioState, PositionInfo};
use crate::risk::spot::{RiskOutput, SpotRiskManager};
use crate::sink::Sink;
use crate::strategy::{router::Router, Strategy};
use crate::types::{Horizon, Signal};

pub struct SpotHandler {
    exchange: Arc<SpotClient>,
    fetcher: Arc<DataFetcher>,
    risk: Arc<SpotRiskManager>,
    executor: SpotExecutor,
    sink: Arc<Sink>,

    // Order-flow state, per symbol.
    aggregators: HashMap<String, BarAggregator>,
    last_trade_id: HashMap<String, i64>,
    cache_loaded: HashSet<String>,

    // Scheduling state, per symbol.
    last_strategy_slot: HashMap<String, i64>,
    cooldown_until: HashMap<String, DateTime<Utc>>,
}

impl SpotHandler {
    pub fn new(
        exchange: Arc<SpotClient>,
        fetcher: Arc<DataFetcher>,
        risk: Arc<SpotRiskManager>,
        executor: SpotExecutor,
        sink: Arc<Sink>,
    ) -> Self {
        Self {
            exchange,
            fetcher,
            risk,
            executor,
            sink,
            aggregators: HashMap::new(),
            last_trade_id: HashMap::new(),
            cache_loaded: HashSet::new(),
            last_strategy_slot: HashMap::new(),
            cooldown_until: HashMap::new(),
        }
    }

    pub fn set_executor(&mut self, executor: SpotExecutor) {
        self.executor = executor;
    }

    /// Drop slot memoization and cache-loaded flags (strategy hot-reload).
    pub fn clear_slot_memo(&mut self) {
        self.last_strategy_slot.clear();
        self.cache_loaded.clear();
    }

    /// Process one symbol for one cycle.
    pub async fn process_symbol(
        &mut self,
        settings: &Settings,
        llm: &LlmDecisionEngine,
        symbol: &str,
        cycle_id: &str,
        strategies: &mut [Strategy],
    ) -> Result<()> {
        let sc = &settings.spot;

        // ── 1. Order-flow ingestion — every cycle, slot-independent ──────
        self.ingest_order_flow(settings, symbol, strategies).await;

        // ── 2. Per-timeframe slot guard for OHLCV strategies ─────────────
        let finest_minutes = finest_timeframe_minutes(strategies);
        let slot = current_slot(finest_minutes, Utc::now());
        if self.last_strategy_slot.get(symbol) == Some(&slot) {
            return Ok(());
        }
        self.last_strategy_slot.insert(symbol.to_string(), slot);

        // ── 3. Grouped OHLCV fetch with short-TTL cache ──────────────────
        let tf_dataframes = self.fetch_timeframes(sc, symbol, strategies).await;
        if tf_dataframes.is_empty() {
            warn!(symbol, "no OHLCV data available — skipping symbol");
            return Ok(());
        }

        // ── 4. Current price = close of the finest timeframe ─────────────
        let finest_tf = tf_dataframes
            .keys()
            .min_by_key(|tf| timeframe_minutes(tf).unwrap_or(u32::MAX))
            .cloned()
            .unwrap_or_default();
        let finest_df = tf_dataframes[&finest_tf].clone();
        let Some(current_price) = finest_df.last().map(|c| c.close) else {
            return Ok(());
        };
        info!(symbol, price = current_price, "spot price");
        self.sink
            .insert_market_snapshot(symbol, current_price, sc.mode.as_str())
            .await;

        // ── 5. Protective-order check ────────────────────────────────────
        if self.executor.is_live() && self.risk.has_exchange_sl_tp(symbol) {
            if self.sync_oco_order(settings, symbol).await {
                return Ok(());
            }
        }
        if !self.risk.has_exchange_sl_tp(symbol)
            && self.risk.check_stop_loss_take_profit(symbol, current_price) == Signal::Sell
        {
            info!(symbol, "stored SL/TP triggered — selling");
            self.execute_sell(settings, symbol, current_price, cycle_id).await;
            return Ok(());
        }

        // ── 6. Strategy fan-out into a per-invocation router ─────────────
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
                        "spot",
                        &verdict.timeframe,
                    )
                    .await;
                info!(
                    strategy = %verdict.strategy_name,
                    timeframe = %if verdict.timeframe.is_empty() { "of" } else { verdict.timeframe.as_str() },
                    signal = %verdict.signal,
                    confidence = verdict.confidence,
                    reasoning = %verdict.reasoning.chars().take(80).collect::<String>(),
                    "verdict"
                );
                router.collect(verdict);
            }
        }

        let verdicts = router.get_verdicts();
        if verdicts.is_empty() {
            return Ok(());
        }

        // ── 7. Pre-compute advisory risk metrics ─────────────────────────
        let primary_signal = verdicts
            .iter()
            .find(|v| v.signal != Signal::Hold)
            .map(|v| v.signal);
        let risk_metrics = if primary_signal == Some(Signal::Buy) {
            match self.exchange.get_balance().await {
                Ok(balance) => {
                    let usdt = balance.get("USDT").copied().unwrap_or(0.0);
                    self.risk.pre_calculate_metrics(
                        Signal::Buy,
                        symbol,
                        current_price,
                        usdt,
                        Some(&finest_df),
                        Horizon::Medium,
                    )
                }
                Err(e) => {
                    warn!(symbol, error = %e, "risk pre-calc skipped: balance unavailable");
                    None
                }
            }
        } else {
            None
        };

        // ── 8. Multi-timeframe summary from the frames already fetched ───
        let mtf_summaries = build_mtf_summaries(settings, &tf_dataframes);

        // ── 9. LLM decision gate ─────────────────────────────────────────
        let portfolio = self.build_portfolio_state(settings, symbol, current_price).await;
        let decision = llm
            .make_decision(
                &verdicts,
                &portfolio,
                symbol,
                current_price,
                "spot",
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
                "spot",
            )
            .await;

        if decision.signal == Signal::Hold {
            info!(symbol, "decision: HOLD");
            return Ok(());
        }

        // ── 10. Confidence floor ─────────────────────────────────────────
        if decision.confidence < settings.llm.min_confidence {
            info!(
                symbol,
                signal = %decision.signal,
                confidence = decision.confidence,
                floor = settings.llm.min_confidence,
                "confidence below floor — HOLD"
            );
            return Ok(());
        }

        info!(
            symbol,
            signal = %decision.signal,
            confidence = decision.confidence,
            horizon = %decision.horizon,
            "decision"
        );

        // ── 11. Guards + risk + execution ────────────────────────────────
        match decision.signal {
            Signal::Buy => {
                if self.is_in_cooldown(symbol) {
                    return Ok(());
                }
                self.handle_buy(settings, symbol, current_price, cycle_id, &decision, &finest_df)
                    .await;
            }
            Signal::Sell => {
                if let Some(hold_min) = self.hold_minutes(symbol) {
                    let min_hold = self.min_hold_for(symbol);
                    if hold_min < min_hold {
                        info!(
                            symbol,
                            held_min = hold_min,
                            min_hold,
                            "minimum-hold guard — not closing yet"
                        );
                        return Ok(());
                    }
                }
                self.execute_sell(settings, symbol, current_price, cycle_id).await;
            }
            // Spot never shorts; SHORT/COVER cannot reach here.
            other => debug!(symbol, signal = %other, "signal ignored on spot"),
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Order-flow ingestion
    // -------------------------------------------------------------------------

    async fn ingest_order_flow(
        &mut self,
        settings: &Settings,
        symbol: &str,
        strategies: &mut [Strategy],
    ) {
        for strategy in strategies.iter_mut() {
            let Strategy::OrderFlow(s) = strategy else {
                continue;
            };

            if !self.cache_loaded.contains(symbol) {
                s.load_cache(symbol);
                self.cache_loaded.insert(symbol.to_string());
            }

            let raw_trades = match self.exchange.fetch_agg_trades(symbol, 1000).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(symbol, error = %e, "aggTrades fetch failed");
                    continue;
                }
            };
            if raw_trades.is_empty() {
                continue;
            }

            let aggregator = self.aggregators.entry(symbol.to_string()).or_insert_with(|| {
                BarAggregator::new(
                    settings.orderflow.bar_interval_seconds,
                    settings.orderflow.tick_size,
                )
            });
            let last_id = self.last_trade_id.get(symbol).copied().unwrap_or(0);
            let (_, new_id) = s.feed_trades(symbol, &raw_trades, aggregator, last_id);
            if new_id > 0 {
                self.last_trade_id.insert(symbol.to_string(), new_id);
            }
        }
    }

    // -------------------------------------------------------------------------
    // OHLCV fetch
    // -------------------------------------------------------------------------

    async fn fetch_timeframes(
        &self,
        sc: &crate::config::SpotConfig,
        symbol: &str,
        strategies: &[Strategy],
    ) -> HashMap<String, Vec<Candle>> {
        // Group OHLCV strategies by timeframe and take the max lookback.
        let mut tf_required: HashMap<String, usize> = HashMap::new();
        for strategy in strategies {
            if let Strategy::Ohlcv(s) = strategy {
                let tf = if s.timeframe().is_empty() {
                    sc.timeframe.clone()
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
                Err(e) => warn!(symbol, timeframe = %tf, error = %e, "OHLCV fetch failed"),
            }
        }
        out
    }

    // -------------------------------------------------------------------------
    // Execution paths
    // -------------------------------------------------------------------------

    async fn handle_buy(
        &mut self,
        settings: &Settings,
        symbol: &str,
        price: f64,
        cycle_id: &str,
        decision: &DecisionResult,
        ohlcv: &[Candle],
    ) {
        // Balance, with the flexible-earn recovery pre-step.
        let mut balance = match self.exchange.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(symbol, error = %e, "balance unavailable — BUY skipped");
                return;
            }
        };
        let mut usdt = balance.get("USDT").copied().unwrap_or(0.0);
        let earn = balance.get("LDUSDT").copied().unwrap_or(0.0);
        if usdt < 1.0 && earn > 0.0 {
            info!(symbol, usdt, earn, "free USDT low — redeeming flexible earn");
            match self.exchange.redeem_all_usdt_earn().await {
                Ok(redeemed) if redeemed > 0.0 => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    if let Ok(fresh) = self.exchange.get_balance().await {
                        balance = fresh;
                        usdt = balance.get("USDT").copied().unwrap_or(0.0);
                    }
                }
                Ok(_) => warn!(symbol, "nothing redeemable from flexible earn"),
                Err(e) => warn!(symbol, error = %e, "earn redemption failed"),
            }
        }

        let mut risk_output = self.risk.evaluate(
            Signal::Buy,
            symbol,
            price,
            usdt,
            decision.horizon,
            decision.llm_size_pct,
            decision.stop_loss,
            decision.take_profit,
            Some(ohlcv),
        );
        if !risk_output.approved {
            info!(symbol, reason = %risk_output.reason, "risk rejected BUY");
            return;
        }

        // LLM-override halving, unless it would break the exchange minimum
        // notional — then the full size stands.
        if decision.llm_override && risk_output.quantity > 0.0 {
            let halved = risk_output.quantity / 2.0;
            let min_notional = self.exchange.get_min_notional(symbol).await.unwrap_or(0.0);
            let halved_notional = halved * price;
            if min_notional > 0.0 && halved_notional < min_notional {
                info!(
                    symbol,
                    halved_notional,
                    min_notional,
                    quantity = risk_output.quantity,
                    "override halving would break min notional — keeping full size"
                );
            } else {
                risk_output.quantity = halved;
                info!(symbol, quantity = risk_output.quantity, "override — half size");
            }
        }

        self.execute_buy(settings, symbol, price, &risk_output, cycle_id, decision)
            .await;
    }

    async fn execute_buy(
        &mut self,
        settings: &Settings,
        symbol: &str,
        price: f64,
        risk_output: &RiskOutput,
        cycle_id: &str,
        decision: &DecisionResult,
    ) {
        let Some(order) = self.executor.execute(Signal::Buy, symbol, risk_output).await else {
            return;
        };
        let fill_price = order["price"].as_f64().unwrap_or(price);

        // Best-effort protective orders; polling covers a failed placement.
        let mut tp_order_id = None;
        let mut sl_order_id = None;
        if let Some(oco) = self
            .executor
            .place_sl_tp(
                symbol,
                risk_output.quantity,
                risk_output.take_profit_price,
                risk_output.stop_loss_price,
            )
            .await
        {
            tp_order_id = oco["tp_order_id"].as_str().map(|s| s.to_string());
            sl_order_id = oco["sl_order_id"].as_str().map(|s| s.to_string());
        }

        self.risk.add_position(
            symbol,
            risk_output.quantity,
            fill_price,
            tp_order_id,
            sl_order_id,
            risk_output.stop_loss_price,
            risk_output.take_profit_price,
            decision.horizon,
            decision.reasoning.clone(),
        );

        let mode = settings.spot.mode.as_str();
        self.sink
            .insert_order(&order, mode, cycle_id, "spot", None, 1, false)
            .await;
        self.sink
            .upsert_position(
                symbol,
                serde_json::json!({
                    "quantity": risk_output.quantity,
                    "entry_price": fill_price,
                    "current_price": fill_price,
                    "unrealized_pnl": 0,
                    "stop_loss": risk_output.stop_loss_price,
                    "take_profit": risk_output.take_profit_price,
                    "entry_horizon": decision.horizon.as_str(),
                    "entry_reasoning": decision.reasoning,
                }),
                mode,
                "spot",
            )
            .await;

        info!(
            symbol,
            fill_price,
            quantity = risk_output.quantity,
            stop_loss = risk_output.stop_loss_price,
            take_profit = risk_output.take_profit_price,
            "BUY complete"
        );
    }

    async fn execute_sell(&mut self, settings: &Settings, symbol: &str, price: f64, cycle_id: &str) {
        let (tp_id, sl_id) = self.risk.get_sl_tp_order_ids(symbol);
        if tp_id.is_some() || sl_id.is_some() {
            self.executor
                .cancel_sl_tp(symbol, tp_id.as_deref(), sl_id.as_deref())
                .await;
            info!(symbol, "resting SL/TP cancelled");
        }

        let risk_output = self.risk.evaluate(
            Signal::Sell,
            symbol,
            price,
            0.0,
            Horizon::Medium,
            0.0,
            0.0,
            0.0,
            None,
        );
        if !risk_output.approved {
            return;
        }

        let mode = settings.spot.mode.as_str();

        // Dust below the exchange minimum cannot be sold — clean up
        // internally instead of spamming rejected orders.
        let notional = risk_output.quantity * price;
        let min_notional = self.exchange.get_min_notional(symbol).await.unwrap_or(0.0);
        if min_notional > 0.0 && notional < min_notional {
            info!(
                symbol,
                notional, min_notional, "position below min notional — internal cleanup"
            );
            let pnl = self.risk.remove_position(symbol, price);
            self.sink.delete_position(symbol, mode, "spot", "long").await;
            info!(symbol, pnl, "dust position cleaned up");
            self.set_cooldown(settings, symbol);
            return;
        }

        let Some(order) = self.executor.execute(Signal::Sell, symbol, &risk_output).await else {
            return;
        };
        let fill_price = order["price"].as_f64().unwrap_or(price);
        let pnl = self.risk.remove_position(symbol, fill_price);

        self.sink
            .insert_order(&order, mode, cycle_id, "spot", None, 1, false)
            .await;
        self.sink.delete_position(symbol, mode, "spot", "long").await;
        info!(symbol, fill_price, pnl, "SELL complete");
        self.set_cooldown(settings, symbol);
    }

    /// Poll resting OCO legs; a fill closes the position. Returns true when
    /// the position was closed here.
    async fn sync_oco_order(&mut self, settings: &Settings, symbol: &str) -> bool {
        let (tp_id, sl_id) = self.risk.get_sl_tp_order_ids(symbol);
        for (order_id, label) in [(tp_id, "take-profit"), (sl_id, "stop-loss")] {
            let Some(order_id) = order_id else { continue };
            match self.executor.order_status(&order_id, symbol).await {
                Ok(status) if status["status"] == "closed" => {
                    let fill_price = status["price"].as_f64().unwrap_or(0.0);
                    let pnl = self.risk.remove_position(symbol, fill_price);
                    self.sink
                        .delete_position(symbol, settings.spot.mode.as_str(), "spot", "long")
                        .await;
                    info!(symbol, label, fill_price, pnl, "exchange protective order filled");
                    self.set_cooldown(settings, symbol);
                    return true;
                }
                Ok(_) => {}
                Err(e) => debug!(symbol, order_id, error = %e, "OCO status query failed"),
            }
        }
        false
    }

    // -------------------------------------------------------------------------
    // Guards
    // -------------------------------------------------------------------------

    fn set_cooldown(&mut self, settings: &Settings, symbol: &str) {
        let minutes = settings.spot.cooldown_minutes;
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
        let remaining = (until - now).num_minutes();
        info!(symbol, remaining_min = remaining, "in cooldown — no new entry");
        true
    }

    /// Minutes the current position has been held; None without a position.
    fn hold_minutes(&self, symbol: &str) -> Option<i64> {
        let position = self.risk.get_position(symbol)?;
        Some((Utc::now() - position.opened_at).num_minutes())
    }

    fn min_hold_for(&self, symbol: &str) -> i64 {
        self.risk
            .get_position(symbol)
            .map(|p| p.entry_horizon.min_hold_minutes())
            .unwrap_or(0)
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
        let usdt_balance = match self.exchange.get_balance().await {
            Ok(b) => {
                b.get("USDT").copied().unwrap_or(0.0) + b.get("LDUSDT").copied().unwrap_or(0.0)
            }
            Err(_) => 0.0,
        };

        let open_positions = self.risk.get_all_positions();
        let daily_pnl = self.risk.daily_pnl();
        let count = open_positions.len() as u32;

        let mut positions = Vec::with_capacity(open_positions.len());
        for (sym, p) in open_positions {
            let price = if sym == symbol { current_price } else { p.entry_price };
            let pnl = (price - p.entry_price) * p.quantity;
            let pnl_pct = if p.entry_price > 0.0 {
                (price - p.entry_price) / p.entry_price
            } else {
                0.0
            };
            let held_min = (Utc::now() - p.opened_at).num_minutes();
            positions.push(PositionInfo {
                symbol: sym,
                quantity: p.quantity,
                entry_price: p.entry_price,
                current_price: price,
                unrealized_pnl: pnl,
                unrealized_pnl_pct: pnl_pct,
                holding_duration: format_hold_duration(held_min),
                side: "long".into(),
                leverage: 1,
                liquidation_price: None,
                entry_horizon: p.entry_horizon.as_str().to_string(),
                entry_reasoning: p.entry_reasoning,
            });
        }

        let sc = &settings.spot;
        PortfolioState {
            available_balance: usdt_balance,
            positions,
            max_positions: sc.max_open_positions,
            current_position_count: count,
            daily_realized_pnl: daily_pnl,
            daily_risk_remaining: usdt_balance * sc.max_daily_loss_pct + daily_pnl,
            margin_balance: 0.0,
            margin_ratio: 0.0,
            leverage: 0,
        }
    }
}

/// Per-timeframe summaries from frames already fetched this cycle.
pub(crate) fn build_mtf_summaries(
    settings: &Settings,
    tf_dataframes: &HashMap<String, Vec<Candle>>,
) -> Vec<TimeframeSummary> {
    if !settings.mtf.enabled {
        return Vec::new();
    }
    let limit = settings.mtf.candle_limit as usize;
    let mut summaries: Vec<TimeframeSummary> = tf_dataframes
        .iter()
        .filter_map(|(tf, candles)| {
            let window = &candles[candles.len().saturating_sub(limit)..];
            compute_timeframe_summary(window, tf)
        })
        .collect();
    summaries.sort_by_key(|s| timeframe_minutes(&s.timeframe).unwrap_or(u32::MAX));
    summaries
}
