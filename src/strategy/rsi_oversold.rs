// =============================================================================
// RSI mean-reversion strategy — oversold recovery / overbought rollover
// =============================================================================

use std::collections::BTreeMap;

use crate::data::models::Candle;
use crate::indicators::rsi;
use crate::strategy::{param_f64, param_usize, OhlcvStrategy, StrategyVerdict};
use crate::types::Signal;

pub struct RsiOversoldStrategy {
    timeframe: String,
    period: usize,
    oversold: f64,
    overbought: f64,
}

impl RsiOversoldStrategy {
    pub fn new(timeframe: &str, params: &BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            timeframe: timeframe.to_string(),
            period: param_usize(params, "period", 14),
            oversold: param_f64(params, "oversold", 30.0),
            overbought: param_f64(params, "overbought", 70.0),
        }
    }
}

impl OhlcvStrategy for RsiOversoldStrategy {
    fn name(&self) -> &str {
        "rsi_oversold"
    }

    fn timeframe(&self) -> &str {
        &self.timeframe
    }

    fn required_candles(&self) -> usize {
        self.period + 2
    }

    fn generate_verdict(&self, candles: &[Candle]) -> StrategyVerdict {
        if candles.len() < self.required_candles() {
            return StrategyVerdict::hold(self.name(), &self.timeframe, "insufficient candles");
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let series = rsi(&closes, self.period);
        let n = series.len();

        let (Some(rsi_now), Some(rsi_prev)) = (series[n - 1], series[n - 2]) else {
            return StrategyVerdict::hold(self.name(), &self.timeframe, "RSI not ready");
        };

        // Recovery out of the oversold zone buys; rollover out of the
        // overbought zone sells.
        let signal = if rsi_prev < self.oversold && rsi_now >= self.oversold {
            Signal::Buy
        } else if rsi_prev > self.overbought && rsi_now <= self.overbought {
            Signal::Sell
        } else {
            Signal::Hold
        };

        // The deeper the prior extreme, the higher the reversal conviction.
        let confidence = match signal {
            Signal::Buy => {
                let depth = ((self.oversold - rsi_prev).max(0.0)) / self.oversold;
                (0.5 + depth * 0.5).min(1.0)
            }
            Signal::Sell => {
                let depth = ((rsi_prev - self.overbought).max(0.0)) / (100.0 - self.overbought);
                (0.5 + depth * 0.5).min(1.0)
            }
            _ => 0.0,
        };

        let mut indicators = BTreeMap::new();
        indicators.insert("rsi".into(), rsi_now);

        StrategyVerdict {
            strategy_name: self.name().into(),
            signal,
            confidence,
            reasoning: format!(
                "RSI({})={:.1} | oversold<{:.0} overbought>{:.0}",
                self.period, rsi_now, self.oversold, self.overbought
            ),
            timeframe: self.timeframe.clone(),
            key_evidence: Vec::new(),
            indicators,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .map(|&c| Candle {
                open_time: 0,
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    fn strategy() -> RsiOversoldStrategy {
        let mut params = BTreeMap::new();
        params.insert("period".into(), serde_json::json!(5));
        RsiOversoldStrategy::new("15m", &params)
    }

    #[test]
    fn oversold_recovery_is_buy() {
        // Hard selloff drives RSI deep, then a strong bounce lifts it back.
        let mut closes: Vec<f64> = (0..12).map(|i| 120.0 - 4.0 * i as f64).collect();
        closes.push(90.0);
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Buy);
        assert!(verdict.confidence >= 0.5);
    }

    #[test]
    fn overbought_rollover_is_sell() {
        let mut closes: Vec<f64> = (0..12).map(|i| 80.0 + 4.0 * i as f64).collect();
        closes.push(110.0);
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Sell);
    }

    #[test]
    fn mid_range_is_hold() {
        let closes = vec![100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0, 101.0];
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Hold);
    }
}
