// =============================================================================
// Trading supervisor — the cycle orchestrator
// =============================================================================
//
// One supervisory loop drives everything. Each iteration:
//   1. bump the cycle counter (resumed from the sink on boot)
//   2. apply any newer remote config (hot-reload)
//   3. process every spot symbol, then every futures symbol
//   4. run the loan guardian
//   5. periodically reconcile positions against the exchange
//   6. persist a balance snapshot, heartbeat, and flush buffered logs
//   7. sleep until the next cycle
//
// Per-symbol failures are isolated: an error is logged with context and the
// iteration continues with the next symbol. SIGINT flips the running flag and
// the current iteration finishes before the loop exits.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::data::bar_aggregator::BarAggregator;
use crate::data::fetcher::{DataFetcher, MarketClient};
use crate::data::stream::run_agg_trade_stream;
use crate::exchange::futures::FuturesClient;
use crate::exchange::spot::SpotClient;
use crate::execution::futures::FuturesExecutor;
use crate::execution::spot::SpotExecutor;
use crate::handler::futures::FuturesHandler;
use crate::handler::spot::SpotHandler;
use crate::llm::client::LlmClient;
use crate::llm::engine::LlmDecisionEngine;
use crate::llm::schemas::PortfolioState;
use crate::loan_guardian::LoanGuardian;
use crate::reconcile::Reconciler;
use crate::risk::futures::FuturesRiskManager;
use crate::risk::spot::SpotRiskManager;
use crate::sink::Sink;
use crate::strategy::{build_strategies, OrderFlowStrategy, Strategy};
use crate::types::{Horizon, PositionSide, Signal, TradingMode};

/// Reconcile positions every N cycles (plus once at startup).
const RECONCILE_EVERY: u64 = 10;

struct FuturesModule {
    exchange: Arc<FuturesClient>,
    fetcher: Arc<DataFetcher>,
    risk: Arc<FuturesRiskManager>,
    handler: FuturesHandler,
    /// Independent roster; empty means the spot roster is shared.
    strategies: Vec<Strategy>,
}

pub struct TradingBot {
    settings: Settings,
    sink: Arc<Sink>,
    config_version: i64,
    strategy_fingerprint: String,
    strategies: Vec<Strategy>,
    llm: LlmDecisionEngine,

    spot_exchange: Arc<SpotClient>,
    spot_fetcher: Arc<DataFetcher>,
    spot_risk: Arc<SpotRiskManager>,
    spot_handler: SpotHandler,

    futures: Option<FuturesModule>,
    loan_guardian: Option<LoanGuardian>,

    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    start_time: Instant,
}

impl TradingBot {
    pub async fn new(config_path: Option<&std::path::Path>) -> Result<Self> {
        let mut settings = Settings::load(config_path)?;
        let sink = Arc::new(Sink::from_env());

        // Remote config outranks the local file when a newer version exists.
        let mut config_version = 0;
        if let Some(remote) = sink.load_config().await {
            match Settings::from_value(&remote, &settings) {
                Ok(next) => {
                    settings = next;
                    config_version = sink.last_config_version();
                    info!(version = config_version, "remote config applied");
                }
                Err(e) => warn!(error = %e, "remote config rejected — using local file"),
            }
        }

        info!(mode = %settings.spot.mode, "initialising trading supervisor");

        // Spot stack. Orders route to the testnet only in testnet mode;
        // balances and loans always need production endpoints.
        let force_production = settings.spot.mode != TradingMode::Testnet;
        let spot_exchange = Arc::new(SpotClient::new(&settings.exchange, force_production));
        let spot_fetcher = Arc::new(DataFetcher::new(MarketClient::Spot(spot_exchange.clone())));
        let spot_risk = Arc::new(SpotRiskManager::new(
            settings.spot.clone(),
            settings.horizon_risk.clone(),
        ));
        let spot_executor = SpotExecutor::new(spot_exchange.clone(), settings.spot.mode);
        let spot_handler = SpotHandler::new(
            spot_exchange.clone(),
            spot_fetcher.clone(),
            spot_risk.clone(),
            spot_executor,
            sink.clone(),
        );

        let strategies = build_strategies(
            &settings.strategies,
            &settings.spot.timeframe,
            &settings.orderflow,
        );
        let strategy_fingerprint = settings.strategy_fingerprint();

        let llm = LlmDecisionEngine::new(&settings.llm);

        let mut bot = Self {
            settings,
            sink,
            config_version,
            strategy_fingerprint,
            strategies,
            llm,
            spot_exchange,
            spot_fetcher,
            spot_risk,
            spot_handler,
            futures: None,
            loan_guardian: None,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            start_time: Instant::now(),
        };

        bot.restore_spot_positions().await;
        if bot.settings.futures.enabled {
            bot.futures = Some(bot.init_futures().await);
        }
        if bot.settings.loan_guard.enabled {
            bot.loan_guardian = Some(bot.build_loan_guardian());
        }

        // Exchange truth wins immediately after rehydration.
        bot.reconciler().reconcile_all(&bot.settings, "startup").await;

        Ok(bot)
    }

    fn build_loan_guardian(&self) -> LoanGuardian {
        LoanGuardian::new(
            self.spot_exchange.clone(),
            self.sink.clone(),
            LlmClient::new(&self.settings.llm),
            self.settings.loan_guard.clone(),
        )
    }

    async fn init_futures(&self) -> FuturesModule {
        let fc = &self.settings.futures;
        info!(
            pairs = ?fc.pairs,
            leverage = fc.leverage,
            margin_type = %fc.margin_type,
            mode = %fc.mode,
            "initialising futures module"
        );

        let exchange = Arc::new(FuturesClient::new(&self.settings.exchange, fc));
        let fetcher = Arc::new(DataFetcher::new(MarketClient::Futures(exchange.clone())));
        let risk = Arc::new(FuturesRiskManager::new(
            fc.clone(),
            self.settings.horizon_risk.clone(),
        ));
        let executor =
            FuturesExecutor::new(exchange.clone(), fc.mode, self.settings.exchange.testnet);
        let handler = FuturesHandler::new(
            exchange.clone(),
            fetcher.clone(),
            risk.clone(),
            executor,
            self.sink.clone(),
        );

        // Restore persisted futures positions for this mode.
        let rows = self.sink.load_positions(fc.mode.as_str(), "futures").await;
        let mut restored = 0;
        for row in &rows {
            let side = row
                .side
                .as_deref()
                .and_then(PositionSide::parse)
                .unwrap_or(PositionSide::Long);
            if !row.symbol.is_empty() && row.quantity > 0.0 && row.entry_price > 0.0 {
                risk.add_position(
                    &row.symbol,
                    side,
                    row.quantity,
                    row.entry_price,
                    row.leverage.unwrap_or(fc.leverage),
                    None,
                    None,
                    row.stop_loss.unwrap_or(0.0),
                    row.take_profit.unwrap_or(0.0),
                );
                restored += 1;
            }
        }
        if restored > 0 {
            info!(count = restored, mode = %fc.mode, "futures positions restored from sink");
        }

        // An explicit futures roster overrides the shared spot roster.
        let strategies = if fc.strategies.is_empty() {
            Vec::new()
        } else {
            build_strategies(&fc.strategies, &fc.timeframe, &self.settings.orderflow)
        };

        FuturesModule {
            exchange,
            fetcher,
            risk,
            handler,
            strategies,
        }
    }

    async fn restore_spot_positions(&self) {
        let mode = self.settings.spot.mode.as_str();
        let rows = self.sink.load_positions(mode, "spot").await;
        let mut restored = 0;
        for row in &rows {
            if !row.symbol.is_empty() && row.quantity > 0.0 && row.entry_price > 0.0 {
                self.spot_risk.add_position(
                    &row.symbol,
                    row.quantity,
                    row.entry_price,
                    None,
                    None,
                    row.stop_loss.unwrap_or(0.0),
                    row.take_profit.unwrap_or(0.0),
                    Horizon::Medium,
                    String::new(),
                );
                restored += 1;
            }
        }
        if restored > 0 {
            info!(count = restored, mode, "spot positions restored from sink");
        }
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Some(self.spot_exchange.clone()),
            self.futures.as_ref().map(|f| f.exchange.clone()),
            Some(self.spot_risk.clone()),
            self.futures.as_ref().map(|f| f.risk.clone()),
            self.sink.clone(),
        )
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.start_time = Instant::now();

        // Ctrl-C flips the flag; the in-flight iteration completes.
        {
            let running = self.running.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("shutdown signal received — finishing current iteration");
                    running.store(false, Ordering::SeqCst);
                    shutdown.notify_waiters();
                }
            });
        }

        self.log_startup_banner();

        let mut cycle = self.sink.get_last_cycle_num().await;
        if cycle > 0 {
            info!(cycle, "resuming cycle counter from sink");
        }

        while self.running.load(Ordering::SeqCst) {
            cycle += 1;
            let cycle_id = format!("c{cycle}-{}", &Uuid::new_v4().simple().to_string()[..8]);
            info!(cycle, cycle_id = %cycle_id, "cycle start");
            self.sink
                .insert_log("info", "app", &format!("cycle {cycle} start ({cycle_id})"))
                .await;

            self.reload_config_if_changed().await;

            // ── Spot symbols ─────────────────────────────────────────────
            let spot_pairs = self.settings.spot.pairs.clone();
            for symbol in &spot_pairs {
                let result = self
                    .spot_handler
                    .process_symbol(
                        &self.settings,
                        &self.llm,
                        symbol,
                        &cycle_id,
                        &mut self.strategies,
                    )
                    .await;
                if let Err(e) = result {
                    error!(symbol = %symbol, error = %format!("{e:#}"), "spot symbol processing failed");
                    self.sink
                        .insert_log("error", "spot_handler", &format!("{symbol}: {e:#}"))
                        .await;
                }
            }

            // ── Futures symbols ──────────────────────────────────────────
            if let Some(futures) = &mut self.futures {
                let futures_pairs = self.settings.futures.pairs.clone();
                let roster = if futures.strategies.is_empty() {
                    &mut self.strategies
                } else {
                    &mut futures.strategies
                };
                for symbol in &futures_pairs {
                    let result = futures
                        .handler
                        .process_symbol(&self.settings, &self.llm, symbol, &cycle_id, roster)
                        .await;
                    if let Err(e) = result {
                        error!(symbol = %symbol, error = %format!("{e:#}"), "futures symbol processing failed");
                        self.sink
                            .insert_log("error", "futures_handler", &format!("{symbol}: {e:#}"))
                            .await;
                    }
                }
                if let Err(e) = futures.handler.record_margin().await {
                    warn!(error = %e, "futures margin snapshot failed");
                }
            }

            // ── Loan guardian ────────────────────────────────────────────
            if let Some(guardian) = &mut self.loan_guardian {
                if let Err(e) = guardian.check().await {
                    error!(error = %format!("{e:#}"), "loan guardian check failed");
                }
            }

            // ── Periodic reconciliation ──────────────────────────────────
            if cycle % RECONCILE_EVERY == 0 {
                self.reconciler().reconcile_all(&self.settings, "periodic").await;
            }

            // ── Balance snapshot + heartbeat ─────────────────────────────
            self.record_balance_snapshot(cycle).await;
            self.sink
                .update_bot_status(
                    cycle,
                    "running",
                    self.config_version,
                    &self.settings.spot.pairs,
                    self.start_time.elapsed().as_secs(),
                )
                .await;
            self.sink.flush_logs().await;

            if self.running.load(Ordering::SeqCst) {
                let sleep = Duration::from_secs(self.settings.spot.check_interval_seconds);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = self.shutdown.notified() => {}
                }
            }
        }

        self.sink
            .update_bot_status(
                cycle,
                "stopped",
                self.config_version,
                &self.settings.spot.pairs,
                self.start_time.elapsed().as_secs(),
            )
            .await;
        self.sink.flush_logs().await;
        info!("trading supervisor shut down");
        Ok(())
    }

    fn log_startup_banner(&self) {
        let sc = &self.settings.spot;
        let fc = &self.settings.futures;
        let lg = &self.settings.loan_guard;
        info!("=============================================");
        info!(pairs = ?sc.pairs, timeframe = %sc.timeframe, mode = %sc.mode, "[spot]");
        info!(
            strategies = ?self.strategies.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            "[strategies]"
        );
        info!(enabled = self.llm.enabled, "[llm]");
        if fc.enabled {
            info!(pairs = ?fc.pairs, leverage = fc.leverage, mode = %fc.mode, "[futures] enabled");
        } else {
            info!("[futures] disabled");
        }
        if lg.enabled {
            info!(
                target_ltv = lg.target_ltv,
                danger_ltv = lg.danger_ltv,
                low_ltv = lg.low_ltv,
                dry_run = lg.dry_run,
                "[loan-guard] enabled"
            );
        } else {
            info!("[loan-guard] disabled");
        }
        info!("=============================================");
    }

    // -------------------------------------------------------------------------
    // Config hot-reload
    // -------------------------------------------------------------------------

    async fn reload_config_if_changed(&mut self) {
        let Some(remote) = self.sink.load_config().await else {
            return;
        };
        let next = match Settings::from_value(&remote, &self.settings) {
            Ok(next) => next,
            Err(e) => {
                error!(error = %e, "new remote config rejected — keeping current settings");
                return;
            }
        };
        self.config_version = self.sink.last_config_version();
        info!(version = self.config_version, "applying new remote config");

        // Atomically rebind settings, then push the pieces that cache them.
        self.settings = next;
        self.spot_risk
            .update_config(self.settings.spot.clone(), self.settings.horizon_risk.clone());
        self.spot_handler.set_executor(SpotExecutor::new(
            self.spot_exchange.clone(),
            self.settings.spot.mode,
        ));
        self.llm = LlmDecisionEngine::new(&self.settings.llm);

        // Futures module enable / disable / reconfigure.
        if self.settings.futures.enabled && self.futures.is_none() {
            self.futures = Some(self.init_futures().await);
            info!("futures module enabled");
        } else if !self.settings.futures.enabled && self.futures.is_some() {
            self.futures = None;
            info!("futures module disabled");
        } else if let Some(futures) = &mut self.futures {
            futures.risk.update_config(
                self.settings.futures.clone(),
                self.settings.horizon_risk.clone(),
            );
        }

        // Loan guardian enable / disable / reconfigure.
        if self.settings.loan_guard.enabled && self.loan_guardian.is_none() {
            self.loan_guardian = Some(self.build_loan_guardian());
        } else if !self.settings.loan_guard.enabled {
            self.loan_guardian = None;
        } else if let Some(guardian) = &mut self.loan_guardian {
            guardian.config = self.settings.loan_guard.clone();
        }

        // Strategy hot-reload when the roster fingerprint moved.
        let fingerprint = self.settings.strategy_fingerprint();
        if fingerprint != self.strategy_fingerprint {
            let old: Vec<String> = self.strategies.iter().map(|s| s.name().to_string()).collect();
            self.strategies = build_strategies(
                &self.settings.strategies,
                &self.settings.spot.timeframe,
                &self.settings.orderflow,
            );
            if let Some(futures) = &mut self.futures {
                futures.strategies = if self.settings.futures.strategies.is_empty() {
                    Vec::new()
                } else {
                    build_strategies(
                        &self.settings.futures.strategies,
                        &self.settings.futures.timeframe,
                        &self.settings.orderflow,
                    )
                };
                futures.handler.clear_slot_memo();
                futures.fetcher.clear_cache();
            }
            self.spot_handler.clear_slot_memo();
            self.spot_fetcher.clear_cache();
            self.strategy_fingerprint = fingerprint;
            let new: Vec<String> = self.strategies.iter().map(|s| s.name().to_string()).collect();
            info!(old = ?old, new = ?new, "strategies hot-reloaded");
        }
    }

    // -------------------------------------------------------------------------
    // Balance snapshot
    // -------------------------------------------------------------------------

    /// Value every asset to USDT where a ticker exists and persist one
    /// snapshot row per currency.
    async fn record_balance_snapshot(&self, cycle: u64) {
        let balances = match self.spot_exchange.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "balance snapshot skipped");
                return;
            }
        };

        let mut usdt_values: HashMap<String, Option<f64>> = HashMap::new();
        for (currency, amount) in &balances {
            // Flexible-earn wrappers ("LDUSDT") value as the base asset.
            let base = currency.strip_prefix("LD").unwrap_or(currency);
            if matches!(base, "USDT" | "USDC" | "BUSD" | "FDUSD") {
                usdt_values.insert(currency.clone(), Some(*amount));
            } else {
                let value = self
                    .spot_exchange
                    .get_ticker(&format!("{base}/USDT"))
                    .await
                    .ok()
                    .map(|t| amount * t.last);
                usdt_values.insert(currency.clone(), value);
            }
        }

        let snapshot_id = format!(
            "cycle-{cycle}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        self.sink
            .insert_balances(&balances, &usdt_values, &snapshot_id)
            .await;
    }
}

// =============================================================================
// WebSocket-driven async variant
// =============================================================================

/// `run-async`: a single cooperative task driven by the aggTrade stream of
/// the first spot pair. Completed bars feed the order-flow strategy; non-HOLD
/// verdicts still go through the LLM gate before any order. Reconnects with a
/// 5 s back-off, bounded per the stream contract.
pub async fn run_async(config_path: Option<&std::path::Path>) -> Result<()> {
    let settings = Settings::load(config_path)?;
    let sink = Arc::new(Sink::from_env());

    let symbol = settings
        .spot
        .pairs
        .first()
        .cloned()
        .unwrap_or_else(|| "BTC/USDT".to_string());
    info!(symbol = %symbol, "starting WebSocket-driven trading");

    let force_production = settings.spot.mode != TradingMode::Testnet;
    let exchange = Arc::new(SpotClient::new(&settings.exchange, force_production));
    let risk = Arc::new(SpotRiskManager::new(
        settings.spot.clone(),
        settings.horizon_risk.clone(),
    ));
    let executor = SpotExecutor::new(exchange.clone(), settings.spot.mode);
    let llm = LlmDecisionEngine::new(&settings.llm);

    let mut strategy = crate::strategy::flow_composite::FlowCompositeStrategy::new(
        &settings.orderflow,
        &Default::default(),
    );
    strategy.load_cache(&symbol);
    let mut aggregator = BarAggregator::new(
        settings.orderflow.bar_interval_seconds,
        settings.orderflow.tick_size,
    );

    let (tx, mut rx) = mpsc::channel(1024);
    let stream_symbol = symbol.clone();
    let stream_task = tokio::spawn(async move {
        let mut backoff = Duration::from_secs(5);
        loop {
            match run_agg_trade_stream(&stream_symbol, &tx).await {
                Ok(()) => break, // receiver dropped — shut down
                Err(e) => {
                    error!(error = %e, "aggTrade stream error — reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received");
                break;
            }
            trade = rx.recv() => {
                let Some(trade) = trade else { break };
                let Some(bar) = aggregator.add_trade(trade) else { continue };
                let close = bar.close;
                let verdict = strategy.on_bar(&symbol, bar);

                // Stored SL/TP polling happens on every completed bar.
                if risk.check_stop_loss_take_profit(&symbol, close) == Signal::Sell {
                    execute_async_signal(&exchange, &risk, &executor, Signal::Sell, &symbol, close).await;
                }

                if verdict.signal == Signal::Hold {
                    continue;
                }
                let portfolio = async_portfolio(&exchange, &risk, &settings, &symbol, close).await;
                let decision = llm
                    .make_decision(&[verdict], &portfolio, &symbol, close, "spot", None, &[])
                    .await;
                sink.insert_llm_decision(
                    &symbol,
                    decision.signal.as_str(),
                    decision.confidence,
                    &decision.reasoning,
                    llm.model(),
                    "",
                    "spot",
                )
                .await;
                if decision.signal != Signal::Hold
                    && decision.confidence >= settings.llm.min_confidence
                {
                    execute_async_signal(&exchange, &risk, &executor, decision.signal, &symbol, close)
                        .await;
                }
            }
        }
    }

    stream_task.abort();
    sink.flush_logs().await;
    info!("WebSocket trading stopped");
    Ok(())
}

async fn execute_async_signal(
    exchange: &Arc<SpotClient>,
    risk: &Arc<SpotRiskManager>,
    executor: &SpotExecutor,
    signal: Signal,
    symbol: &str,
    price: f64,
) {
    if !matches!(signal, Signal::Buy | Signal::Sell) {
        return;
    }
    let balance = match exchange.get_balance().await {
        Ok(b) => b.get("USDT").copied().unwrap_or(0.0),
        Err(_) => 0.0,
    };
    let risk_output = risk.evaluate(
        signal,
        symbol,
        price,
        balance,
        Horizon::Medium,
        0.0,
        0.0,
        0.0,
        None,
    );
    if !risk_output.approved {
        info!(symbol, reason = %risk_output.reason, "risk rejected");
        return;
    }
    let Some(order) = executor.execute(signal, symbol, &risk_output).await else {
        return;
    };
    let fill_price = order["price"].as_f64().unwrap_or(price);
    match signal {
        Signal::Buy => risk.add_position(
            symbol,
            risk_output.quantity,
            fill_price,
            None,
            None,
            risk_output.stop_loss_price,
            risk_output.take_profit_price,
            Horizon::Medium,
            String::new(),
        ),
        Signal::Sell => {
            risk.remove_position(symbol, fill_price);
        }
        _ => {}
    }
}

async fn async_portfolio(
    exchange: &Arc<SpotClient>,
    risk: &Arc<SpotRiskManager>,
    settings: &Settings,
    symbol: &str,
    price: f64,
) -> PortfolioState {
    let balance = match exchange.get_balance().await {
        Ok(b) => b.get("USDT").copied().unwrap_or(0.0),
        Err(_) => 0.0,
    };
    let positions = risk
        .get_all_positions()
        .into_iter()
        .map(|(sym, p)| {
            let now = if sym == symbol { price } else { p.entry_price };
            crate::llm::schemas::PositionInfo {
                symbol: sym,
                quantity: p.quantity,
                entry_price: p.entry_price,
                current_price: now,
                unrealized_pnl: (now - p.entry_price) * p.quantity,
                unrealized_pnl_pct: if p.entry_price > 0.0 {
                    (now - p.entry_price) / p.entry_price
                } else {
                    0.0
                },
                side: "long".into(),
                leverage: 1,
                ..Default::default()
            }
        })
        .collect();

    PortfolioState {
        available_balance: balance,
        positions,
        max_positions: settings.spot.max_open_positions,
        current_position_count: risk.open_position_count() as u32,
        daily_realized_pnl: risk.daily_pnl(),
        daily_risk_remaining: balance * settings.spot.max_daily_loss_pct + risk.daily_pnl(),
        ..Default::default()
    }
}
