// =============================================================================
// Order-flow core indicators: Delta, CVD, CVD Z-score
// =============================================================================

use std::collections::{BTreeMap, VecDeque};

use crate::data::models::OrderFlowBar;

/// Cumulative Volume Delta: running sum of per-bar delta, bounded history.
pub struct CvdCalculator {
    deltas: VecDeque<f64>,
    values: VecDeque<f64>,
    cumulative: f64,
    max_history: usize,
}

impl CvdCalculator {
    pub fn new(max_history: usize) -> Self {
        Self {
            deltas: VecDeque::with_capacity(max_history),
            values: VecDeque::with_capacity(max_history),
            cumulative: 0.0,
            max_history: max_history.max(1),
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }

    pub fn update(&mut self, bar: &OrderFlowBar) -> f64 {
        let delta = bar.delta();
        self.cumulative += delta;
        self.deltas.push_back(delta);
        self.values.push_back(self.cumulative);
        while self.deltas.len() > self.max_history {
            self.deltas.pop_front();
        }
        while self.values.len() > self.max_history {
            self.values.pop_front();
        }
        self.cumulative
    }
}

/// Z-score of the latest CVD value against a rolling window.
pub struct CvdZScore {
    lookback: usize,
    current: f64,
}

impl CvdZScore {
    pub fn new(lookback: usize) -> Self {
        Self {
            lookback: lookback.max(2),
            current: 0.0,
        }
    }

    pub fn update(&mut self, cvd_values: &[f64]) -> f64 {
        if cvd_values.len() < self.lookback {
            self.current = 0.0;
            return 0.0;
        }
        let window = &cvd_values[cvd_values.len() - self.lookback..];
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        let variance =
            window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window.len() as f64;
        let std = variance.sqrt();

        self.current = if std < 1e-10 {
            0.0
        } else {
            (window[window.len() - 1] - mean) / std
        };
        self.current
    }
}

/// Unified engine: updates Delta/CVD/Z-score per completed bar and keeps the
/// OHLC series the detectors scan.
pub struct OrderFlowIndicatorEngine {
    pub cvd: CvdCalculator,
    pub zscore: CvdZScore,
    prices: VecDeque<f64>,
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
    max_history: usize,
}

impl OrderFlowIndicatorEngine {
    pub fn new(max_history: usize, zscore_lookback: usize) -> Self {
        Self {
            cvd: CvdCalculator::new(max_history),
            zscore: CvdZScore::new(zscore_lookback),
            prices: VecDeque::with_capacity(max_history),
            highs: VecDeque::with_capacity(max_history),
            lows: VecDeque::with_capacity(max_history),
            max_history: max_history.max(1),
        }
    }

    pub fn prices(&self) -> Vec<f64> {
        self.prices.iter().copied().collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.highs.iter().copied().collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.lows.iter().copied().collect()
    }

    /// Process a completed bar and return the indicator snapshot attached to
    /// the strategy verdict.
    pub fn on_bar(&mut self, bar: &OrderFlowBar) -> BTreeMap<String, f64> {
        self.prices.push_back(bar.close);
        self.highs.push_back(bar.high);
        self.lows.push_back(bar.low);
        while self.prices.len() > self.max_history {
            self.prices.pop_front();
        }
        while self.highs.len() > self.max_history {
            self.highs.pop_front();
        }
        while self.lows.len() > self.max_history {
            self.lows.pop_front();
        }

        let cvd = self.cvd.update(bar);
        let z = self.zscore.update(&self.cvd.values());

        let mut out = BTreeMap::new();
        out.insert("delta".into(), bar.delta());
        out.insert("delta_pct".into(), bar.delta_pct());
        out.insert("cvd".into(), cvd);
        out.insert("cvd_zscore".into(), z);
        out.insert("buy_volume".into(), bar.buy_volume);
        out.insert("sell_volume".into(), bar.sell_volume);
        out.insert("vwap".into(), bar.vwap);
        out
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64, buy: f64, sell: f64) -> OrderFlowBar {
        OrderFlowBar {
            open_time: 0,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: buy + sell,
            buy_volume: buy,
            sell_volume: sell,
            trade_count: 1,
            vwap: close,
            footprint: Default::default(),
        }
    }

    #[test]
    fn cvd_accumulates() {
        let mut cvd = CvdCalculator::new(10);
        cvd.update(&bar(100.0, 5.0, 2.0)); // +3
        cvd.update(&bar(101.0, 1.0, 4.0)); // -3
        cvd.update(&bar(102.0, 6.0, 1.0)); // +5
        assert!((cvd.values().last().unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(cvd.values(), vec![3.0, 0.0, 5.0]);
    }

    #[test]
    fn cvd_history_bounded() {
        let mut cvd = CvdCalculator::new(3);
        for i in 0..10 {
            cvd.update(&bar(100.0 + i as f64, 2.0, 1.0));
        }
        assert_eq!(cvd.values().len(), 3);
        // Cumulative keeps growing even as history trims.
        assert!((cvd.values().last().unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn zscore_zero_until_window_fills() {
        let mut z = CvdZScore::new(5);
        assert!((z.update(&[1.0, 2.0]).abs()) < f64::EPSILON);
        let val = z.update(&[1.0, 2.0, 3.0, 4.0, 10.0]);
        assert!(val > 1.0);
    }

    #[test]
    fn zscore_flat_series_is_zero() {
        let mut z = CvdZScore::new(5);
        assert!((z.update(&[2.0; 8]).abs()) < f64::EPSILON);
    }

    #[test]
    fn engine_snapshot_fields() {
        let mut engine = OrderFlowIndicatorEngine::new(100, 5);
        let snap = engine.on_bar(&bar(100.0, 6.0, 2.0));
        assert!((snap["delta"] - 4.0).abs() < 1e-9);
        assert!((snap["cvd"] - 4.0).abs() < 1e-9);
        assert!((snap["delta_pct"] - 0.5).abs() < 1e-9);
        assert_eq!(engine.prices(), vec![100.0]);
    }
}
