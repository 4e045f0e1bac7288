// =============================================================================
// Order-flow composite strategy — divergence + SFP + absorption + trapped
// =============================================================================
//
// Weighted score of four detectors:
//   CVD divergence 40%, SFP 30%, absorption 20%, trapped traders 10%.
// A side must clear `signal_threshold` and beat the other side to emit a
// signal.
//
// Completed bars are persisted per symbol as a small JSON blob (OHLC +
// volumes + VWAP + counts; footprint excluded — cheap to recompute, costly
// to serialize) and replayed through the indicator engine on restart.
// =============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::OrderFlowConfig;
use crate::data::models::OrderFlowBar;
use crate::orderflow::absorption::{AbsorptionDetector, AbsorptionDirection};
use crate::orderflow::divergence::DivergenceDetector;
use crate::orderflow::indicators::OrderFlowIndicatorEngine;
use crate::orderflow::sfp::{SfpDetector, SfpDirection};
use crate::orderflow::trapped::{TrappedSide, TrappedTraderAnalyzer};
use crate::strategy::{OrderFlowStrategy, StrategyVerdict};
use crate::types::Signal;

const WEIGHT_DIVERGENCE: f64 = 0.40;
const WEIGHT_SFP: f64 = 0.30;
const WEIGHT_ABSORPTION: f64 = 0.20;
const WEIGHT_TRAPPED: f64 = 0.10;

/// Cache format version; bump on layout changes so stale blobs are skipped.
const CACHE_VERSION: u32 = 1;

fn cache_dir() -> PathBuf {
    let base = std::env::var("BOT_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    PathBuf::from(base).join("orderflow_cache")
}

#[derive(Serialize, Deserialize)]
struct CachedBar {
    ts: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    bv: f64,
    sv: f64,
    tc: u64,
    vw: f64,
}

#[derive(Serialize, Deserialize)]
struct CacheBlob {
    v: u32,
    bars: Vec<CachedBar>,
}

impl CachedBar {
    fn from_bar(bar: &OrderFlowBar) -> Self {
        Self {
            ts: bar.open_time,
            o: bar.open,
            h: bar.high,
            l: bar.low,
            c: bar.close,
            v: bar.volume,
            bv: bar.buy_volume,
            sv: bar.sell_volume,
            tc: bar.trade_count,
            vw: bar.vwap,
        }
    }

    fn into_bar(self) -> OrderFlowBar {
        OrderFlowBar {
            open_time: self.ts,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
            buy_volume: self.bv,
            sell_volume: self.sv,
            trade_count: self.tc,
            vwap: self.vw,
            footprint: Default::default(),
        }
    }
}

pub struct FlowCompositeStrategy {
    signal_threshold: f64,
    engine: OrderFlowIndicatorEngine,
    divergence: DivergenceDetector,
    sfp: SfpDetector,
    absorption: AbsorptionDetector,
    trapped: TrappedTraderAnalyzer,
    bars: VecDeque<OrderFlowBar>,
    max_bars: usize,
    last_verdict: Option<StrategyVerdict>,
}

impl FlowCompositeStrategy {
    pub fn new(config: &OrderFlowConfig, params: &BTreeMap<String, serde_json::Value>) -> Self {
        let threshold = params
            .get("signal_threshold")
            .and_then(|v| v.as_f64())
            .unwrap_or(config.signal_threshold);
        Self {
            signal_threshold: threshold,
            engine: OrderFlowIndicatorEngine::new(config.cvd_lookback, config.zscore_lookback),
            divergence: DivergenceDetector::new(config.divergence_peak_order),
            sfp: SfpDetector::new(config.sfp_swing_lookback),
            absorption: AbsorptionDetector::new(config.absorption_lookback),
            trapped: TrappedTraderAnalyzer::default(),
            bars: VecDeque::with_capacity(config.cvd_lookback),
            max_bars: config.cvd_lookback.max(1),
            last_verdict: None,
        }
    }

    /// Bars needed before scores mean anything.
    fn required_bars(&self) -> usize {
        30
    }

    fn cache_file(symbol: &str) -> PathBuf {
        cache_dir().join(format!("{}.json", symbol.replace('/', "_")))
    }

    fn save_cache(&self, symbol: &str) {
        let blob = CacheBlob {
            v: CACHE_VERSION,
            bars: self.bars.iter().map(CachedBar::from_bar).collect(),
        };
        let json = match serde_json::to_string(&blob) {
            Ok(j) => j,
            Err(e) => {
                debug!(symbol, error = %e, "failed to serialise order-flow cache");
                return;
            }
        };
        let write = std::fs::create_dir_all(cache_dir())
            .and_then(|_| std::fs::write(Self::cache_file(symbol), json));
        if let Err(e) = write {
            debug!(symbol, error = %e, "failed to save order-flow cache");
        }
    }

    fn push_bar(&mut self, bar: OrderFlowBar) {
        self.bars.push_back(bar);
        while self.bars.len() > self.max_bars {
            self.bars.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Scoring
    // -------------------------------------------------------------------------

    fn calculate_scores(&self) -> (f64, f64, Vec<String>) {
        let mut bullish = 0.0;
        let mut bearish = 0.0;
        let mut evidence = Vec::new();

        let prices = self.engine.prices();
        let cvd_values = self.engine.cvd.values();

        // 1. CVD divergence (40%)
        let mut div_bull: f64 = 0.0;
        let mut div_bear: f64 = 0.0;
        for div in self.divergence.detect(&prices, &cvd_values) {
            if div.divergence_type.is_bullish() {
                div_bull = div_bull.max(div.strength);
            } else {
                div_bear = div_bear.max(div.strength);
            }
            evidence.push(format!(
                "CVD {} divergence (strength {:.2})",
                div.divergence_type.label(),
                div.strength
            ));
        }
        bullish += div_bull * WEIGHT_DIVERGENCE;
        bearish += div_bear * WEIGHT_DIVERGENCE;

        // 2. SFP (30%)
        let highs = self.engine.highs();
        let lows = self.engine.lows();
        let mut sfp_bull: f64 = 0.0;
        let mut sfp_bear: f64 = 0.0;
        for event in self.sfp.detect(&highs, &lows, &prices) {
            match event.direction {
                SfpDirection::Bullish => {
                    sfp_bull = sfp_bull.max(event.strength);
                    evidence.push(format!(
                        "bullish SFP @ {:.2} (strength {:.2})",
                        event.swing_price, event.strength
                    ));
                }
                SfpDirection::Bearish => {
                    sfp_bear = sfp_bear.max(event.strength);
                    evidence.push(format!(
                        "bearish SFP @ {:.2} (strength {:.2})",
                        event.swing_price, event.strength
                    ));
                }
            }
        }
        bullish += sfp_bull * WEIGHT_SFP;
        bearish += sfp_bear * WEIGHT_SFP;

        // 3. Absorption (20%)
        if let Some(event) = self.absorption.detect(&prices, &cvd_values) {
            match event.direction {
                AbsorptionDirection::Bullish => {
                    bullish += event.strength * WEIGHT_ABSORPTION;
                    evidence.push(format!("bullish absorption (strength {:.2})", event.strength));
                }
                AbsorptionDirection::Bearish => {
                    bearish += event.strength * WEIGHT_ABSORPTION;
                    evidence.push(format!("bearish absorption (strength {:.2})", event.strength));
                }
            }
        }

        // 4. Trapped traders (10%)
        let bars: Vec<OrderFlowBar> = self.bars.iter().cloned().collect();
        let mut trap_bull: f64 = 0.0;
        let mut trap_bear: f64 = 0.0;
        for event in self.trapped.detect(&bars) {
            match event.side {
                TrappedSide::TrappedShorts => {
                    trap_bull = trap_bull.max(event.strength);
                    evidence.push(format!("trapped shorts @ {:.2}", event.trap_price));
                }
                TrappedSide::TrappedLongs => {
                    trap_bear = trap_bear.max(event.strength);
                    evidence.push(format!("trapped longs @ {:.2}", event.trap_price));
                }
            }
        }
        bullish += trap_bull * WEIGHT_TRAPPED;
        bearish += trap_bear * WEIGHT_TRAPPED;

        (bullish, bearish, evidence)
    }

    fn build_reasoning(bullish: f64, bearish: f64, signal: Signal) -> String {
        let verdict = match signal {
            Signal::Buy => "bullish score clears threshold and leads",
            Signal::Sell => "bearish score clears threshold and leads",
            _ => "neither side clears the threshold",
        };
        format!("bullish {bullish:.3} vs bearish {bearish:.3} — {verdict}")
    }
}

impl OrderFlowStrategy for FlowCompositeStrategy {
    fn name(&self) -> &str {
        "orderflow_composite"
    }

    fn load_cache(&mut self, symbol: &str) -> usize {
        let path = Self::cache_file(symbol);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return 0;
        };
        let blob: CacheBlob = match serde_json::from_str(&raw) {
            Ok(b) => b,
            Err(e) => {
                warn!(symbol, error = %e, "order-flow cache unreadable — ignoring");
                return 0;
            }
        };
        if blob.v != CACHE_VERSION {
            warn!(symbol, version = blob.v, "order-flow cache version mismatch — ignoring");
            return 0;
        }

        let mut count = 0;
        for cached in blob.bars {
            let bar = cached.into_bar();
            self.engine.on_bar(&bar);
            self.push_bar(bar);
            count += 1;
        }
        if count > 0 {
            info!(symbol, bars = count, "order-flow cache replayed");
        }
        count
    }

    fn on_bar(&mut self, symbol: &str, bar: OrderFlowBar) -> StrategyVerdict {
        let indicators = self.engine.on_bar(&bar);
        self.push_bar(bar);
        self.save_cache(symbol);

        if self.bars.len() < self.required_bars() {
            let verdict = StrategyVerdict {
                strategy_name: self.name().into(),
                signal: Signal::Hold,
                confidence: 0.0,
                reasoning: format!(
                    "warming up ({}/{} bars)",
                    self.bars.len(),
                    self.required_bars()
                ),
                timeframe: String::new(),
                key_evidence: Vec::new(),
                indicators,
            };
            self.last_verdict = Some(verdict.clone());
            return verdict;
        }

        let (bullish, bearish, evidence) = self.calculate_scores();

        let (signal, confidence) = if bullish >= self.signal_threshold && bullish > bearish {
            (Signal::Buy, bullish)
        } else if bearish >= self.signal_threshold && bearish > bullish {
            (Signal::Sell, bearish)
        } else {
            (Signal::Hold, 0.0)
        };

        let mut indicators = indicators;
        indicators.insert("bullish_score".into(), bullish);
        indicators.insert("bearish_score".into(), bearish);

        let verdict = StrategyVerdict {
            strategy_name: self.name().into(),
            signal,
            confidence,
            reasoning: Self::build_reasoning(bullish, bearish, signal),
            timeframe: String::new(),
            key_evidence: evidence,
            indicators,
        };
        self.last_verdict = Some(verdict.clone());
        verdict
    }

    fn latest_verdict(&self, _symbol: &str) -> Option<StrategyVerdict> {
        self.last_verdict.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar_aggregator::BarAggregator;
    use crate::data::models::AggTrade;

    fn config() -> OrderFlowConfig {
        serde_yaml::from_str("{}").unwrap()
    }

    fn bar(ts: i64, close: f64, buy: f64, sell: f64) -> OrderFlowBar {
        OrderFlowBar {
            open_time: ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: buy + sell,
            buy_volume: buy,
            sell_volume: sell,
            trade_count: 3,
            vwap: close,
            footprint: Default::default(),
        }
    }

    fn unique_symbol(tag: &str) -> String {
        format!("TEST{tag}{}/USDT", std::process::id())
    }

    #[test]
    fn warming_up_holds() {
        std::env::set_var("BOT_DATA_DIR", std::env::temp_dir().join("meridian-test"));
        let mut strat = FlowCompositeStrategy::new(&config(), &BTreeMap::new());
        let sym = unique_symbol("warm");
        let verdict = strat.on_bar(&sym, bar(0, 100.0, 5.0, 5.0));
        assert_eq!(verdict.signal, Signal::Hold);
        assert!(verdict.reasoning.contains("warming up"));
        let _ = std::fs::remove_file(FlowCompositeStrategy::cache_file(&sym));
    }

    #[test]
    fn cache_roundtrip_reproduces_state() {
        std::env::set_var("BOT_DATA_DIR", std::env::temp_dir().join("meridian-test"));
        let sym = unique_symbol("cache");

        let mut first = FlowCompositeStrategy::new(&config(), &BTreeMap::new());
        for i in 0..40 {
            first.on_bar(&sym, bar(i * 60_000, 100.0 + (i % 5) as f64, 6.0, 4.0));
        }
        let original = first.latest_verdict(&sym).unwrap();

        // Fresh instance replays the persisted bars and lands on the same state.
        let mut second = FlowCompositeStrategy::new(&config(), &BTreeMap::new());
        let loaded = second.load_cache(&sym);
        assert_eq!(loaded, 40);
        let replayed = second.on_bar(&sym, bar(41 * 60_000, 101.0, 6.0, 4.0));
        assert_eq!(second.bars.len(), 41);
        // Same inputs → same score fields exist either way.
        assert!(original.indicators.contains_key("cvd"));
        assert!(replayed.indicators.contains_key("bullish_score"));

        let _ = std::fs::remove_file(FlowCompositeStrategy::cache_file(&sym));
    }

    #[test]
    fn feed_trades_filters_by_id_and_advances() {
        std::env::set_var("BOT_DATA_DIR", std::env::temp_dir().join("meridian-test"));
        let sym = unique_symbol("feed");
        let mut strat = FlowCompositeStrategy::new(&config(), &BTreeMap::new());
        let mut agg = BarAggregator::new(60, 0.01);

        let trades: Vec<AggTrade> = (0..10)
            .map(|i| AggTrade {
                trade_id: i,
                price: 100.0,
                quantity: 1.0,
                timestamp: i * 10_000,
                is_buyer_maker: i % 2 == 0,
            })
            .collect();

        let (_, last_id) = strat.feed_trades(&sym, &trades, &mut agg, 4);
        // Only ids 5..=9 are new.
        assert_eq!(last_id, 9);

        // Re-feeding the same batch yields nothing new.
        let (_, last_id) = strat.feed_trades(&sym, &trades, &mut agg, 9);
        assert_eq!(last_id, 0);

        let _ = std::fs::remove_file(FlowCompositeStrategy::cache_file(&sym));
    }

    #[test]
    fn stale_cache_version_ignored() {
        std::env::set_var("BOT_DATA_DIR", std::env::temp_dir().join("meridian-test"));
        let sym = unique_symbol("stale");
        let path = FlowCompositeStrategy::cache_file(&sym);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"v": 99, "bars": []}"#).unwrap();

        let mut strat = FlowCompositeStrategy::new(&config(), &BTreeMap::new());
        assert_eq!(strat.load_cache(&sym), 0);
        let _ = std::fs::remove_file(path);
    }
}
