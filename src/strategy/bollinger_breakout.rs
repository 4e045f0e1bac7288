// =============================================================================
// Bollinger band reclaim strategy — volatility extremes snapping back
// =============================================================================

use std::collections::BTreeMap;

use crate::data::models::Candle;
use crate::strategy::{param_f64, param_usize, OhlcvStrategy, StrategyVerdict};
use crate::types::Signal;

pub struct BollingerBreakoutStrategy {
    timeframe: String,
    period: usize,
    std_dev: f64,
}

/// (mid, upper, lower) series; entries before the window fills are `None`.
fn band_series(
    closes: &[f64],
    period: usize,
    std_dev: f64,
) -> Vec<Option<(f64, f64, f64)>> {
    let mut out = vec![None; closes.len()];
    if period < 2 || closes.len() < period {
        return out;
    }
    for i in (period - 1)..closes.len() {
        let window = &closes[i + 1 - period..=i];
        let mid = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|v| (v - mid).powi(2)).sum::<f64>() / period as f64;
        let sd = variance.sqrt();
        out[i] = Some((mid, mid + std_dev * sd, mid - std_dev * sd));
    }
    out
}

impl BollingerBreakoutStrategy {
    pub fn new(timeframe: &str, params: &BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            timeframe: timeframe.to_string(),
            period: param_usize(params, "period", 20),
            std_dev: param_f64(params, "std_dev", 2.0),
        }
    }
}

impl OhlcvStrategy for BollingerBreakoutStrategy {
    fn name(&self) -> &str {
        "bollinger_breakout"
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
        let bands = band_series(&closes, self.period, self.std_dev);
        let n = closes.len();

        let (Some((mid, upper, lower)), Some((_, prev_upper, prev_lower))) =
            (bands[n - 1], bands[n - 2])
        else {
            return StrategyVerdict::hold(self.name(), &self.timeframe, "bands not ready");
        };

        let close = closes[n - 1];
        let prev_close = closes[n - 2];

        // Reclaim of the lower band from below buys; loss of the upper band
        // from above sells.
        let signal = if prev_close < prev_lower && close >= lower {
            Signal::Buy
        } else if prev_close > prev_upper && close <= upper {
            Signal::Sell
        } else {
            Signal::Hold
        };

        let width = upper - lower;
        let pct_b = if width > 0.0 { (close - lower) / width } else { 0.5 };

        let confidence = match signal {
            Signal::Buy => (1.0 - pct_b).clamp(0.3, 1.0),
            Signal::Sell => pct_b.clamp(0.3, 1.0),
            _ => 0.0,
        };

        let mut indicators = BTreeMap::new();
        indicators.insert("bb_upper".into(), upper);
        indicators.insert("bb_mid".into(), mid);
        indicators.insert("bb_lower".into(), lower);
        indicators.insert("bb_pct_b".into(), pct_b);

        StrategyVerdict {
            strategy_name: self.name().into(),
            signal,
            confidence,
            reasoning: format!(
                "BB({},{:.1}) close={:.2} | upper={:.2} mid={:.2} lower={:.2} | %B={:.2}",
                self.period, self.std_dev, close, upper, mid, lower, pct_b
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

    fn strategy() -> BollingerBreakoutStrategy {
        let mut params = BTreeMap::new();
        params.insert("period".into(), serde_json::json!(10));
        BollingerBreakoutStrategy::new("1h", &params)
    }

    #[test]
    fn lower_band_reclaim_is_buy() {
        // Stable range, a crash well below the lower band, then a reclaim.
        let mut closes = vec![100.0, 101.0, 99.0, 100.0, 101.0, 99.0, 100.0, 101.0, 99.0, 100.0];
        closes.push(90.0); // below the lower band
        closes.push(99.0); // back inside
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Buy);
        assert!(verdict.confidence >= 0.3);
    }

    #[test]
    fn upper_band_loss_is_sell() {
        let mut closes = vec![100.0, 101.0, 99.0, 100.0, 101.0, 99.0, 100.0, 101.0, 99.0, 100.0];
        closes.push(110.0);
        closes.push(101.0);
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Sell);
    }

    #[test]
    fn inside_bands_is_hold() {
        let closes = vec![100.0; 15];
        let verdict = strategy().generate_verdict(&candles_from_closes(&closes));
        assert_eq!(verdict.signal, Signal::Hold);
    }
}
