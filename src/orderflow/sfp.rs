// =============================================================================
// Swing Failure Pattern detection
// =============================================================================
//
// Bullish SFP: a wick pierces a prior swing low but the bar closes back above
// it. Bearish SFP: a wick pierces a prior swing high but closes back below.
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SfpDirection {
    Bullish,
    Bearish,
}

#[derive(Debug, Clone)]
pub struct SfpEvent {
    pub direction: SfpDirection,
    /// The pierced swing level.
    pub swing_price: f64,
    /// Furthest wick extreme (low for bullish, high for bearish).
    pub wick_price: f64,
    pub close_price: f64,
    pub bar_index: usize,
    /// 0..1, deeper pierce + stronger reclaim → higher.
    pub strength: f64,
}

/// Local swing high/low detection over a symmetric lookback window.
pub struct SwingDetector {
    pub lookback: usize,
}

impl SwingDetector {
    pub fn new(lookback: usize) -> Self {
        Self {
            lookback: lookback.max(1),
        }
    }

    /// (index, price) of bars whose high dominates both neighbourhoods.
    pub fn find_swing_highs(&self, highs: &[f64]) -> Vec<(usize, f64)> {
        let n = self.lookback;
        let mut swings = Vec::new();
        if highs.len() < 2 * n + 1 {
            return swings;
        }
        for i in n..highs.len() - n {
            let left_max = highs[i - n..i].iter().copied().fold(f64::MIN, f64::max);
            let right_max = highs[i + 1..=i + n].iter().copied().fold(f64::MIN, f64::max);
            if highs[i] >= left_max && highs[i] >= right_max {
                swings.push((i, highs[i]));
            }
        }
        swings
    }

    /// (index, price) of bars whose low undercuts both neighbourhoods.
    pub fn find_swing_lows(&self, lows: &[f64]) -> Vec<(usize, f64)> {
        let n = self.lookback;
        let mut swings = Vec::new();
        if lows.len() < 2 * n + 1 {
            return swings;
        }
        for i in n..lows.len() - n {
            let left_min = lows[i - n..i].iter().copied().fold(f64::MAX, f64::min);
            let right_min = lows[i + 1..=i + n].iter().copied().fold(f64::MAX, f64::min);
            if lows[i] <= left_min && lows[i] <= right_min {
                swings.push((i, lows[i]));
            }
        }
        swings
    }
}

pub struct SfpDetector {
    swing_detector: SwingDetector,
    /// Minimum pierce depth relative to the swing price.
    wick_threshold: f64,
}

impl SfpDetector {
    pub fn new(swing_lookback: usize) -> Self {
        Self {
            swing_detector: SwingDetector::new(swing_lookback),
            wick_threshold: 0.001,
        }
    }

    /// Scan the whole series; each swing point yields at most one event (the
    /// first qualifying bar after it).
    pub fn detect(&self, highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<SfpEvent> {
        if highs.len() < self.swing_detector.lookback * 2 + 2 {
            return Vec::new();
        }
        let mut results = Vec::new();

        for &(swing_idx, swing_price) in self.swing_detector.find_swing_lows(lows).iter().rev() {
            for j in swing_idx + 1..lows.len() {
                if lows[j] < swing_price {
                    let penetration = (swing_price - lows[j]) / swing_price;
                    if penetration >= self.wick_threshold && closes[j] > swing_price {
                        results.push(SfpEvent {
                            direction: SfpDirection::Bullish,
                            swing_price,
                            wick_price: lows[j],
                            close_price: closes[j],
                            bar_index: j,
                            strength: Self::strength(swing_price, lows[j], closes[j]),
                        });
                    }
                    break;
                }
            }
        }

        for &(swing_idx, swing_price) in self.swing_detector.find_swing_highs(highs).iter().rev() {
            for j in swing_idx + 1..highs.len() {
                if highs[j] > swing_price {
                    let penetration = (highs[j] - swing_price) / swing_price;
                    if penetration >= self.wick_threshold && closes[j] < swing_price {
                        results.push(SfpEvent {
                            direction: SfpDirection::Bearish,
                            swing_price,
                            wick_price: highs[j],
                            close_price: closes[j],
                            bar_index: j,
                            strength: Self::strength(swing_price, highs[j], closes[j]),
                        });
                    }
                    break;
                }
            }
        }

        results
    }

    /// Pierce depth × reclaim distance, each capped at 1.
    fn strength(swing_price: f64, wick_price: f64, close_price: f64) -> f64 {
        if swing_price == 0.0 {
            return 0.0;
        }
        let penetration = (wick_price - swing_price).abs() / swing_price;
        let recovery = (close_price - swing_price).abs() / swing_price;
        let pen_score = (penetration * 50.0).min(1.0);
        let rec_score = (recovery * 20.0).min(1.0);
        (pen_score * 0.6 + rec_score * 0.4).min(1.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swing_detection_finds_peak_and_trough() {
        let detector = SwingDetector::new(2);
        let highs = vec![1.0, 2.0, 5.0, 2.0, 1.0, 1.5, 1.0];
        let swings = detector.find_swing_highs(&highs);
        assert!(swings.iter().any(|&(i, p)| i == 2 && (p - 5.0).abs() < 1e-12));

        let lows = vec![5.0, 4.0, 1.0, 4.0, 5.0, 4.5, 5.0];
        let swings = detector.find_swing_lows(&lows);
        assert!(swings.iter().any(|&(i, p)| i == 2 && (p - 1.0).abs() < 1e-12));
    }

    #[test]
    fn bullish_sfp_detected() {
        // Swing low at 100 (index 3), later pierced to 99 with a close at 101.
        let lows = vec![103.0, 102.0, 101.0, 100.0, 101.0, 102.0, 103.0, 99.0, 101.0];
        let highs: Vec<f64> = lows.iter().map(|l| l + 2.0).collect();
        let closes = vec![104.0, 103.0, 102.0, 101.0, 102.0, 103.0, 104.0, 101.0, 102.0];

        let detector = SfpDetector::new(2);
        let events = detector.detect(&highs, &lows, &closes);
        let bullish: Vec<_> = events
            .iter()
            .filter(|e| e.direction == SfpDirection::Bullish)
            .collect();
        assert!(!bullish.is_empty());
        let ev = bullish[0];
        assert_eq!(ev.bar_index, 7);
        assert!((ev.swing_price - 100.0).abs() < 1e-12);
        assert!(ev.strength > 0.0 && ev.strength <= 1.0);
    }

    #[test]
    fn bearish_sfp_detected() {
        let highs = vec![97.0, 98.0, 99.0, 100.0, 99.0, 98.0, 97.0, 101.0, 99.0];
        let lows: Vec<f64> = highs.iter().map(|h| h - 2.0).collect();
        let closes = vec![96.0, 97.0, 98.0, 99.0, 98.0, 97.0, 96.0, 99.0, 98.0];

        let detector = SfpDetector::new(2);
        let events = detector.detect(&highs, &lows, &closes);
        assert!(events.iter().any(|e| e.direction == SfpDirection::Bearish));
    }

    #[test]
    fn shallow_pierce_ignored() {
        // Pierce of 0.05% is below the 0.1% threshold.
        let lows = vec![103.0, 102.0, 101.0, 100.0, 101.0, 102.0, 103.0, 99.95, 101.0];
        let highs: Vec<f64> = lows.iter().map(|l| l + 2.0).collect();
        let closes = vec![104.0, 103.0, 102.0, 101.0, 102.0, 103.0, 104.0, 101.0, 102.0];

        let detector = SfpDetector::new(2);
        let events = detector.detect(&highs, &lows, &closes);
        assert!(events
            .iter()
            .all(|e| e.direction != SfpDirection::Bullish));
    }

    #[test]
    fn too_short_series_yields_nothing() {
        let detector = SfpDetector::new(5);
        assert!(detector.detect(&[1.0; 5], &[1.0; 5], &[1.0; 5]).is_empty());
    }
}
