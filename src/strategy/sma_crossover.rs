// =============================================================================
// SMA crossover strategy — golden / death cross
// =============================================================================

use std::collections::BTreeMap;

use crate::data::models::Candle;
use crate::indicators::sma;
use crate::strategy::{param_usize, OhlcvStrategy, StrategyVerdict};
use crate::types::Signal;

pub struct SmaCrossoverStrategy {
    timeframe: String,
    fast_period: usize,
    slow_period: usize,
}

impl SmaCrossoverStrategy {
    pub fn new(timeframe: &str, params: &BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            timeframe: timeframe.to_string(),
            fast_period: param_usize(params, "fast_period", 10),
            slow_period: param_usize(params, "slow_period", 30),
        }
    }
}

impl OhlcvStrategy for SmaCrossoverStrategy {
    fn name(&self) -> &str {
        "sma_crossover"
    }

    fn timeframe(&self) -> &str {
        &self.timeframe
    }

    fn required_candles(&self) -> usize {
        self.slow_period + 2
    }

    fn generate_verdict(&self, candles: &[Candle]) -> StrategyVerdict {
        if candles.len() < self.required_candles() {
            return StrategyVerdict::hold(self.name(), &self.timeframe, "insufficient candles");
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let fast = sma(&closes, self.fast_period);
        let slow = sma(&closes, self.slow_period);
        let n = closes.len();

        let (Some(fast_now), Some(slow_now), Some(fast_prev), Some(slow_prev)) =
            (fast[n - 1], slow[n - 1], fast[n - 2], slow[n - 2])
        else {
            return StrategyVerdict::hold(self.name(), &self.timeframe, "SMA not ready");
        };

        let signal = if fast_prev <= slow_prev && fast_now > slow_now {
            Signal::Buy
        } else if fast_prev >= slow_prev && fast_now < slow_now {
            Signal::Sell
        } else {
            Signal::Hold
        };

        // Wider separation between the lines → higher conviction.
        let spread = if slow_now > 0.0 {
            (fast_now - slow_now).abs() / slow_now
        } else {
            0.0
        };
        let confidence = if signal != Signal::Hold {
            (spread * 50.0).clamp(0.3, 1.0)
        } else {
            0.0
        };

        let cross = if fast_now > slow_now {
            "golden"
        } else if fast_now < slow_now {
            "death"
        } else {
            "flat"
        };

        let mut indicators = BTreeMap::new();
        indicators.insert("sma_fast".into(), fast_now);
        indicators.insert("sma_slow".into(), slow_now);
        indicators.insert("spread".into(), spread);

        StrategyVerdict {
            strategy_name: self.name().into(),
            signal,
            confidence,
            reasoning: format!(
                "SMA({})={:.2} {} SMA({})={:.2} | {} cross, spread {:.2}%",
                self.fast_period,
                fast_now,
                if fast_now > slow_now { ">" } else { "<" },
                self.slow_period,
                slow_now,
                cross,
                spread * 100.0
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

    fn strategy() -> SmaCrossoverStrategy {
        let mut params = BTreeMap::new();
        params.insert("fast_period".into(), serde_json::json!(3));
        params.insert("slow_period".into(), serde_json::json!(6));
        SmaCrossoverStrategy::new("1h", &params)
    }

    #[test]
    fn golden_cross_is_buy() {
        // Long decline, then a sharp rally: fast SMA crosses above slow.
        let mut closes = vec![110.0, 108.0, 106.0, 104.0, 102.0, 100.0, 98.0, 96.0];
        closes.extend([97.0, 104.0, 112.0]);
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Buy);
        assert!(verdict.confidence >= 0.3);
    }

    #[test]
    fn death_cross_is_sell() {
        let mut closes = vec![90.0, 92.0, 94.0, 96.0, 98.0, 100.0, 102.0, 104.0];
        closes.extend([103.0, 96.0, 88.0]);
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Sell);
    }

    #[test]
    fn no_cross_is_hold() {
        let closes: Vec<f64> = (0..12).map(|i| 100.0 + i as f64).collect();
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Hold);
        assert!((verdict.confidence).abs() < f64::EPSILON);
    }

    #[test]
    fn short_series_holds() {
        let closes = vec![100.0, 101.0, 102.0];
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Hold);
    }
}
