// =============================================================================
// Price / CVD divergence detection
// =============================================================================
//
//   regular bullish: price lower low, CVD higher low   (sell pressure fading)
//   regular bearish: price higher high, CVD lower high (buy pressure fading)
//   hidden bullish:  price higher low, CVD lower low   (uptrend continuation)
//   hidden bearish:  price lower high, CVD higher high (downtrend continuation)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceType {
    RegularBullish,
    RegularBearish,
    HiddenBullish,
    HiddenBearish,
}

impl DivergenceType {
    pub fn is_bullish(&self) -> bool {
        matches!(self, Self::RegularBullish | Self::HiddenBullish)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::RegularBullish => "regular bullish",
            Self::RegularBearish => "regular bearish",
            Self::HiddenBullish => "hidden bullish",
            Self::HiddenBearish => "hidden bearish",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Divergence {
    pub divergence_type: DivergenceType,
    pub price_points: (f64, f64),
    pub cvd_points: (f64, f64),
    pub strength: f64,
    pub bar_indices: (usize, usize),
}

/// Plateau-tolerant local extrema over a symmetric `order` neighbourhood
/// (matches the >=/<= comparison the original analysis used).
pub struct PeakTroughDetector {
    order: usize,
}

impl PeakTroughDetector {
    pub fn new(order: usize) -> Self {
        Self { order: order.max(1) }
    }

    pub fn find_peaks(&self, data: &[f64]) -> Vec<usize> {
        self.find_extrema(data, true)
    }

    pub fn find_troughs(&self, data: &[f64]) -> Vec<usize> {
        self.find_extrema(data, false)
    }

    fn find_extrema(&self, data: &[f64], peaks: bool) -> Vec<usize> {
        let n = self.order;
        if data.len() < 2 * n + 1 {
            return Vec::new();
        }
        let mut out = Vec::new();
        for i in n..data.len() - n {
            let ok = (i - n..=i + n).all(|j| {
                if peaks {
                    data[i] >= data[j]
                } else {
                    data[i] <= data[j]
                }
            });
            if ok {
                out.push(i);
            }
        }
        out
    }
}

pub struct DivergenceDetector {
    detector: PeakTroughDetector,
    min_strength: f64,
}

impl DivergenceDetector {
    pub fn new(peak_order: usize) -> Self {
        Self {
            detector: PeakTroughDetector::new(peak_order),
            min_strength: 0.1,
        }
    }

    /// Compare the two most recent extrema of each series.
    pub fn detect(&self, prices: &[f64], cvd_values: &[f64]) -> Vec<Divergence> {
        if prices.len() != cvd_values.len() || prices.len() < 11 {
            return Vec::new();
        }
        let mut results = Vec::new();

        let price_peaks = self.detector.find_peaks(prices);
        let cvd_peaks = self.detector.find_peaks(cvd_values);
        if price_peaks.len() >= 2 && cvd_peaks.len() >= 2 {
            results.extend(check_bearish(prices, cvd_values, &price_peaks, &cvd_peaks));
        }

        let price_troughs = self.detector.find_troughs(prices);
        let cvd_troughs = self.detector.find_troughs(cvd_values);
        if price_troughs.len() >= 2 && cvd_troughs.len() >= 2 {
            results.extend(check_bullish(prices, cvd_values, &price_troughs, &cvd_troughs));
        }

        results.retain(|d| d.strength >= self.min_strength);
        results
    }
}

fn check_bullish(
    prices: &[f64],
    cvd: &[f64],
    price_troughs: &[usize],
    cvd_troughs: &[usize],
) -> Vec<Divergence> {
    let mut out = Vec::new();
    let pt = &price_troughs[price_troughs.len() - 2..];
    let ct = &cvd_troughs[cvd_troughs.len() - 2..];
    let (p1, p2) = (prices[pt[0]], prices[pt[1]]);
    let (c1, c2) = (cvd[ct[0]], cvd[ct[1]]);

    if p2 < p1 && c2 > c1 {
        out.push(Divergence {
            divergence_type: DivergenceType::RegularBullish,
            price_points: (p1, p2),
            cvd_points: (c1, c2),
            strength: strength(p1, p2, c1, c2),
            bar_indices: (pt[0], pt[1]),
        });
    }
    if p2 > p1 && c2 < c1 {
        out.push(Divergence {
            divergence_type: DivergenceType::HiddenBullish,
            price_points: (p1, p2),
            cvd_points: (c1, c2),
            strength: strength(p1, p2, c1, c2),
            bar_indices: (pt[0], pt[1]),
        });
    }
    out
}

fn check_bearish(
    prices: &[f64],
    cvd: &[f64],
    price_peaks: &[usize],
    cvd_peaks: &[usize],
) -> Vec<Divergence> {
    let mut out = Vec::new();
    let pp = &price_peaks[price_peaks.len() - 2..];
    let cp = &cvd_peaks[cvd_peaks.len() - 2..];
    let (p1, p2) = (prices[pp[0]], prices[pp[1]]);
    let (c1, c2) = (cvd[cp[0]], cvd[cp[1]]);

    if p2 > p1 && c2 < c1 {
        out.push(Divergence {
            divergence_type: DivergenceType::RegularBearish,
            price_points: (p1, p2),
            cvd_points: (c1, c2),
            strength: strength(p1, p2, c1, c2),
            bar_indices: (pp[0], pp[1]),
        });
    }
    if p2 < p1 && c2 > c1 {
        out.push(Divergence {
            divergence_type: DivergenceType::HiddenBearish,
            price_points: (p1, p2),
            cvd_points: (c1, c2),
            strength: strength(p1, p2, c1, c2),
            bar_indices: (pp[0], pp[1]),
        });
    }
    out
}

/// Geometric mean of the two opposing change magnitudes, squashed into 0..1.
fn strength(p1: f64, p2: f64, c1: f64, c2: f64) -> f64 {
    if p1 == 0.0 || c1 == 0.0 {
        return 0.0;
    }
    let price_change = (p2 - p1).abs() / p1.abs();
    let cvd_change = (c2 - c1).abs() / (c1.abs() + 1e-10);
    let raw = (price_change * cvd_change).sqrt();
    (raw * 5.0).tanh()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Two-trough series: price troughs at `pa` then `pb`, CVD at `ca`/`cb`.
    fn v_series(pa: f64, pb: f64, ca: f64, cb: f64) -> (Vec<f64>, Vec<f64>) {
        let mut prices = Vec::new();
        let mut cvd = Vec::new();
        // down to first trough, up, down to second trough, up
        for step in [
            (pa + 10.0, pa, 5),
            (pa, pa + 8.0, 5),
            (pa + 8.0, pb, 5),
            (pb, pb + 6.0, 5),
        ] {
            let (from, to, n) = step;
            for i in 0..n {
                prices.push(from + (to - from) * i as f64 / n as f64);
            }
        }
        for step in [
            (ca + 100.0, ca, 5),
            (ca, ca + 200.0, 5),
            (ca + 200.0, cb, 5),
            (cb, cb + 60.0, 5),
        ] {
            let (from, to, n) = step;
            for i in 0..n {
                cvd.push(from + (to - from) * i as f64 / n as f64);
            }
        }
        (prices, cvd)
    }

    #[test]
    fn peaks_and_troughs() {
        let det = PeakTroughDetector::new(2);
        let data = vec![1.0, 2.0, 5.0, 2.0, 1.0, 0.5, 1.0, 2.0, 3.0];
        let peaks = det.find_peaks(&data);
        assert!(peaks.contains(&2));
        let troughs = det.find_troughs(&data);
        assert!(troughs.contains(&5));
    }

    #[test]
    fn regular_bullish_divergence() {
        // Price lower low (100 → 95), CVD higher low (500 → 600).
        let (prices, cvd) = v_series(100.0, 95.0, 500.0, 600.0);
        let det = DivergenceDetector::new(3);
        let found = det.detect(&prices, &cvd);
        assert!(found
            .iter()
            .any(|d| d.divergence_type == DivergenceType::RegularBullish));
    }

    #[test]
    fn hidden_bullish_divergence() {
        // Price higher low, CVD lower low.
        let (prices, cvd) = v_series(100.0, 104.0, 600.0, 450.0);
        let det = DivergenceDetector::new(3);
        let found = det.detect(&prices, &cvd);
        assert!(found
            .iter()
            .any(|d| d.divergence_type == DivergenceType::HiddenBullish));
    }

    #[test]
    fn aligned_series_no_divergence() {
        // Both make lower lows together: no bullish divergence.
        let (prices, cvd) = v_series(100.0, 95.0, 600.0, 450.0);
        let det = DivergenceDetector::new(3);
        let found = det.detect(&prices, &cvd);
        assert!(!found
            .iter()
            .any(|d| d.divergence_type == DivergenceType::RegularBullish));
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let det = DivergenceDetector::new(3);
        assert!(det.detect(&[1.0; 20], &[1.0; 19]).is_empty());
    }

    #[test]
    fn strength_bounded() {
        let s = strength(100.0, 90.0, 1000.0, 2000.0);
        assert!(s > 0.0 && s <= 1.0);
        assert!((strength(0.0, 1.0, 1.0, 2.0)).abs() < f64::EPSILON);
    }
}
