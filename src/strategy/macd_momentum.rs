// =============================================================================
// MACD momentum strategy — signal-line crossings
// =============================================================================

use std::collections::BTreeMap;

use crate::data::models::Candle;
use crate::strategy::{param_usize, OhlcvStrategy, StrategyVerdict};
use crate::types::Signal;

pub struct MacdMomentumStrategy {
    timeframe: String,
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
}

/// Span-style EMA starting from the first value (pandas `ewm(adjust=False)`).
fn ewm(values: &[f64], span: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    if values.is_empty() {
        return out;
    }
    let k = 2.0 / (span as f64 + 1.0);
    let mut current = values[0];
    out.push(current);
    for &v in &values[1..] {
        current = v * k + current * (1.0 - k);
        out.push(current);
    }
    out
}

impl MacdMomentumStrategy {
    pub fn new(timeframe: &str, params: &BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            timeframe: timeframe.to_string(),
            fast_period: param_usize(params, "fast_period", 12),
            slow_period: param_usize(params, "slow_period", 26),
            signal_period: param_usize(params, "signal_period", 9),
        }
    }
}

impl OhlcvStrategy for MacdMomentumStrategy {
    fn name(&self) -> &str {
        "macd_momentum"
    }

    fn timeframe(&self) -> &str {
        &self.timeframe
    }

    fn required_candles(&self) -> usize {
        self.slow_period + self.signal_period + 2
    }

    fn generate_verdict(&self, candles: &[Candle]) -> StrategyVerdict {
        if candles.len() < self.required_candles() {
            return StrategyVerdict::hold(self.name(), &self.timeframe, "insufficient candles");
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let ema_fast = ewm(&closes, self.fast_period);
        let ema_slow = ewm(&closes, self.slow_period);
        let macd: Vec<f64> = ema_fast
            .iter()
            .zip(&ema_slow)
            .map(|(f, s)| f - s)
            .collect();
        let signal_line = ewm(&macd, self.signal_period);

        let n = macd.len();
        let (macd_now, macd_prev) = (macd[n - 1], macd[n - 2]);
        let (sig_now, sig_prev) = (signal_line[n - 1], signal_line[n - 2]);
        let hist = macd_now - sig_now;

        let signal = if macd_prev <= sig_prev && macd_now > sig_now {
            Signal::Buy
        } else if macd_prev >= sig_prev && macd_now < sig_now {
            Signal::Sell
        } else {
            Signal::Hold
        };

        // Histogram magnitude relative to the MACD line gauges momentum.
        let confidence = if signal != Signal::Hold {
            (hist.abs() / macd_now.abs().max(1e-10)).clamp(0.3, 1.0)
        } else {
            0.0
        };

        let mut indicators = BTreeMap::new();
        indicators.insert("macd".into(), macd_now);
        indicators.insert("macd_signal".into(), sig_now);
        indicators.insert("macd_hist".into(), hist);

        StrategyVerdict {
            strategy_name: self.name().into(),
            signal,
            confidence,
            reasoning: format!(
                "MACD({},{},{}) MACD={:.4} Signal={:.4} Hist={:.4}",
                self.fast_period, self.slow_period, self.signal_period, macd_now, sig_now, hist
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

    fn strategy() -> MacdMomentumStrategy {
        let mut params = BTreeMap::new();
        params.insert("fast_period".into(), serde_json::json!(3));
        params.insert("slow_period".into(), serde_json::json!(6));
        params.insert("signal_period".into(), serde_json::json!(3));
        MacdMomentumStrategy::new("1h", &params)
    }

    #[test]
    fn ewm_converges_to_constant() {
        let out = ewm(&[5.0; 20], 5);
        assert!((out.last().unwrap() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn momentum_flip_up_is_buy() {
        // Steady decline, then one sharp reversal bar flips MACD above its
        // signal line on the final close.
        let mut closes: Vec<f64> = (0..12).map(|i| 120.0 - 2.0 * i as f64).collect();
        closes.push(108.0);
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Buy);
    }

    #[test]
    fn momentum_flip_down_is_sell() {
        let mut closes: Vec<f64> = (0..12).map(|i| 80.0 + 2.0 * i as f64).collect();
        closes.push(92.0);
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Sell);
    }

    #[test]
    fn steady_trend_is_hold() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Hold);
    }
}
