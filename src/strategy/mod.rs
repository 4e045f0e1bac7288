// =============================================================================
// Strategy layer — verdict model, dispatch traits, roster construction
// =============================================================================
//
// Strategies never trade. Each one reduces its data feed to a StrategyVerdict
// and the LLM decision engine (or the weighted-vote fallback) arbitrates.
//
// Two narrow interfaces exist: OHLCV strategies are pure functions over a
// candle window; order-flow strategies are stateful consumers of aggregated
// trades. The handler branches once on the `Strategy` variant.
// =============================================================================

pub mod bollinger_breakout;
pub mod flow_composite;
pub mod macd_momentum;
pub mod router;
pub mod rsi_oversold;
pub mod sma_crossover;

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::config::{OrderFlowConfig, StrategyEntry};
use crate::data::bar_aggregator::BarAggregator;
use crate::data::models::{AggTrade, Candle, OrderFlowBar};
use crate::types::Signal;

/// A strategy's output record: signal, confidence, reasoning and an indicator
/// snapshot. Confidence 0 implies HOLD.
#[derive(Debug, Clone)]
pub struct StrategyVerdict {
    pub strategy_name: String,
    pub signal: Signal,
    /// 0.0 ..= 1.0
    pub confidence: f64,
    pub reasoning: String,
    /// Candle timeframe; empty for order-flow strategies.
    pub timeframe: String,
    pub key_evidence: Vec<String>,
    pub indicators: BTreeMap<String, f64>,
}

impl StrategyVerdict {
    pub fn hold(strategy_name: &str, timeframe: &str, reasoning: impl Into<String>) -> Self {
        Self {
            strategy_name: strategy_name.to_string(),
            signal: Signal::Hold,
            confidence: 0.0,
            reasoning: reasoning.into(),
            timeframe: timeframe.to_string(),
            key_evidence: Vec::new(),
            indicators: BTreeMap::new(),
        }
    }
}

/// Candle-window strategy: stateless verdict generation.
pub trait OhlcvStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn timeframe(&self) -> &str;
    /// Minimum candles needed to emit a meaningful verdict.
    fn required_candles(&self) -> usize;
    fn generate_verdict(&self, candles: &[Candle]) -> StrategyVerdict;
}

/// Aggregated-trade strategy: stateful, fed every cycle.
pub trait OrderFlowStrategy: Send + Sync {
    fn name(&self) -> &str;
    /// Replay persisted bars for `symbol`; returns how many were loaded.
    fn load_cache(&mut self, symbol: &str) -> usize;
    /// Process a completed bar and produce a fresh verdict.
    fn on_bar(&mut self, symbol: &str, bar: OrderFlowBar) -> StrategyVerdict;
    /// Most recent verdict for `symbol`, if any bar has completed yet.
    fn latest_verdict(&self, symbol: &str) -> Option<StrategyVerdict>;

    /// Filter raw trades by id, aggregate into bars, advance internal state.
    /// Returns the freshest verdict and the new last-seen trade id (0 when no
    /// new trades arrived).
    fn feed_trades(
        &mut self,
        symbol: &str,
        raw_trades: &[AggTrade],
        aggregator: &mut BarAggregator,
        last_trade_id: i64,
    ) -> (Option<StrategyVerdict>, i64) {
        let new_trades: Vec<&AggTrade> = raw_trades
            .iter()
            .filter(|t| t.trade_id > last_trade_id)
            .collect();
        if new_trades.is_empty() {
            return (self.latest_verdict(symbol), 0);
        }
        let new_last_id = new_trades.last().map(|t| t.trade_id).unwrap_or(0);

        let mut new_bars: Vec<OrderFlowBar> = Vec::new();
        for t in new_trades {
            if let Some(bar) = aggregator.add_trade(t.clone()) {
                new_bars.push(bar);
            }
        }
        if !new_bars.is_empty() {
            info!(
                strategy = self.name(),
                symbol,
                bars = new_bars.len(),
                "aggTrades produced new bars"
            );
        }

        let mut verdict = None;
        for bar in new_bars {
            verdict = Some(self.on_bar(symbol, bar));
        }
        if verdict.is_none() {
            verdict = self.latest_verdict(symbol);
        }
        (verdict, new_last_id)
    }
}

/// Runtime dispatch between the two strategy shapes.
pub enum Strategy {
    Ohlcv(Box<dyn OhlcvStrategy>),
    OrderFlow(Box<dyn OrderFlowStrategy>),
}

impl Strategy {
    pub fn name(&self) -> &str {
        match self {
            Self::Ohlcv(s) => s.name(),
            Self::OrderFlow(s) => s.name(),
        }
    }
}

// ---------------------------------------------------------------------------
// Param helpers
// ---------------------------------------------------------------------------

pub(crate) fn param_usize(
    params: &BTreeMap<String, serde_json::Value>,
    key: &str,
    default: usize,
) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

pub(crate) fn param_f64(
    params: &BTreeMap<String, serde_json::Value>,
    key: &str,
    default: f64,
) -> f64 {
    params.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Roster construction
// ---------------------------------------------------------------------------

/// Build the strategy roster from config. Unknown names are skipped with a
/// warning; an empty roster falls back to a single SMA crossover on the
/// default timeframe.
pub fn build_strategies(
    entries: &[StrategyEntry],
    default_timeframe: &str,
    orderflow: &OrderFlowConfig,
) -> Vec<Strategy> {
    let mut out: Vec<Strategy> = Vec::new();

    for entry in entries {
        let timeframe = if entry.timeframe.is_empty() {
            default_timeframe.to_string()
        } else {
            entry.timeframe.clone()
        };

        match entry.name.as_str() {
            "sma_crossover" => {
                out.push(Strategy::Ohlcv(Box::new(
                    sma_crossover::SmaCrossoverStrategy::new(&timeframe, &entry.params),
                )));
                info!(strategy = %entry.name, timeframe = %timeframe, "strategy loaded");
            }
            "rsi_oversold" => {
                out.push(Strategy::Ohlcv(Box::new(
                    rsi_oversold::RsiOversoldStrategy::new(&timeframe, &entry.params),
                )));
                info!(strategy = %entry.name, timeframe = %timeframe, "strategy loaded");
            }
            "bollinger_breakout" => {
                out.push(Strategy::Ohlcv(Box::new(
                    bollinger_breakout::BollingerBreakoutStrategy::new(&timeframe, &entry.params),
                )));
                info!(strategy = %entry.name, timeframe = %timeframe, "strategy loaded");
            }
            "macd_momentum" => {
                out.push(Strategy::Ohlcv(Box::new(
                    macd_momentum::MacdMomentumStrategy::new(&timeframe, &entry.params),
                )));
                info!(strategy = %entry.name, timeframe = %timeframe, "strategy loaded");
            }
            "orderflow_composite" => {
                out.push(Strategy::OrderFlow(Box::new(
                    flow_composite::FlowCompositeStrategy::new(orderflow, &entry.params),
                )));
                info!(strategy = %entry.name, "strategy loaded (order-flow)");
            }
            other => {
                warn!(strategy = %other, "unknown strategy — skipped");
            }
        }
    }

    if out.is_empty() {
        out.push(Strategy::Ohlcv(Box::new(
            sma_crossover::SmaCrossoverStrategy::new(default_timeframe, &BTreeMap::new()),
        )));
        info!(timeframe = %default_timeframe, "no roster configured — default sma_crossover");
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, tf: &str) -> StrategyEntry {
        StrategyEntry {
            name: name.into(),
            timeframe: tf.into(),
            params: BTreeMap::new(),
        }
    }

    #[test]
    fn roster_builds_known_strategies() {
        let of: OrderFlowConfig = serde_yaml::from_str("{}").unwrap();
        let entries = vec![
            entry("sma_crossover", "1h"),
            entry("rsi_oversold", "15m"),
            entry("orderflow_composite", ""),
            entry("nonsense", "1h"),
        ];
        let roster = build_strategies(&entries, "1h", &of);
        assert_eq!(roster.len(), 3);
        assert!(matches!(roster[0], Strategy::Ohlcv(_)));
        assert!(matches!(roster[2], Strategy::OrderFlow(_)));
    }

    #[test]
    fn empty_roster_gets_default() {
        let of: OrderFlowConfig = serde_yaml::from_str("{}").unwrap();
        let roster = build_strategies(&[], "4h", &of);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name(), "sma_crossover");
        if let Strategy::Ohlcv(s) = &roster[0] {
            assert_eq!(s.timeframe(), "4h");
        }
    }

    #[test]
    fn empty_timeframe_inherits_default() {
        let of: OrderFlowConfig = serde_yaml::from_str("{}").unwrap();
        let roster = build_strategies(&[entry("sma_crossover", "")], "2h", &of);
        if let Strategy::Ohlcv(s) = &roster[0] {
            assert_eq!(s.timeframe(), "2h");
        } else {
            panic!("expected ohlcv strategy");
        }
    }
}
