// =============================================================================
// Absorption detection — heavy flow with no price response
// =============================================================================
//
// Core measure: the ratio of normalised price slope to normalised CVD slope
// over the lookback window. A ratio near zero means volume is trading without
// moving price — someone is absorbing it.
//
//   CVD falling, price holding → bullish absorption (passive buying)
//   CVD rising,  price holding → bearish absorption (passive selling)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsorptionDirection {
    Bullish,
    Bearish,
}

#[derive(Debug, Clone)]
pub struct AbsorptionEvent {
    pub direction: AbsorptionDirection,
    pub price_slope: f64,
    pub cvd_slope: f64,
    /// Normalised |price slope| / |CVD slope|; smaller = stronger absorption.
    pub slope_ratio: f64,
    pub strength: f64,
    pub bar_index: usize,
}

pub struct AbsorptionDetector {
    lookback: usize,
    slope_ratio_threshold: f64,
    min_cvd_change: f64,
}

impl AbsorptionDetector {
    pub fn new(lookback: usize) -> Self {
        Self {
            lookback: lookback.max(2),
            slope_ratio_threshold: 0.3,
            min_cvd_change: 0.01,
        }
    }

    pub fn detect(&self, prices: &[f64], cvd_values: &[f64]) -> Option<AbsorptionEvent> {
        if prices.len() < self.lookback || cvd_values.len() < self.lookback {
            return None;
        }
        let price_window = &prices[prices.len() - self.lookback..];
        let cvd_window = &cvd_values[cvd_values.len() - self.lookback..];

        let price_slope = linear_slope(price_window);
        let cvd_slope = linear_slope(cvd_window);

        // CVD must actually have moved over the window.
        let cvd_range = (cvd_window[cvd_window.len() - 1] - cvd_window[0]).abs();
        let cvd_mean_abs =
            cvd_window.iter().map(|v| v.abs()).sum::<f64>() / cvd_window.len() as f64 + 1e-10;
        if cvd_range / cvd_mean_abs < self.min_cvd_change {
            return None;
        }

        if cvd_slope.abs() < 1e-10 {
            return None;
        }

        let price_mean = price_window.iter().sum::<f64>() / price_window.len() as f64;
        let price_normalized = price_slope.abs() / (price_mean + 1e-10);
        let cvd_normalized = cvd_slope.abs() / cvd_mean_abs;
        if cvd_normalized < 1e-10 {
            return None;
        }

        let slope_ratio = price_normalized / cvd_normalized;
        if slope_ratio >= self.slope_ratio_threshold {
            return None;
        }

        let direction = if cvd_slope < 0.0 {
            AbsorptionDirection::Bullish
        } else {
            AbsorptionDirection::Bearish
        };
        let strength = (1.0 - slope_ratio / self.slope_ratio_threshold).clamp(0.0, 1.0);

        Some(AbsorptionEvent {
            direction,
            price_slope,
            cvd_slope,
            slope_ratio,
            strength,
            bar_index: prices.len() - 1,
        })
    }
}

/// Least-squares slope over evenly spaced samples.
fn linear_slope(y: &[f64]) -> f64 {
    let n = y.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n as f64 - 1.0) / 2.0;
    let y_mean = y.iter().sum::<f64>() / n as f64;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, &v) in y.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (v - y_mean);
        denominator += dx * dx;
    }
    if denominator.abs() < 1e-10 {
        0.0
    } else {
        numerator / denominator
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slope_of_line() {
        let y: Vec<f64> = (0..10).map(|i| 2.0 * i as f64 + 1.0).collect();
        assert!((linear_slope(&y) - 2.0).abs() < 1e-9);
        assert!((linear_slope(&[5.0; 10])).abs() < 1e-12);
    }

    #[test]
    fn bullish_absorption_detected() {
        // Price flat at ~100, CVD falling hard: passive buyers absorbing sells.
        let prices = vec![100.0; 10];
        let cvd: Vec<f64> = (0..10).map(|i| 1000.0 - 100.0 * i as f64).collect();

        let detector = AbsorptionDetector::new(10);
        let event = detector.detect(&prices, &cvd).expect("absorption expected");
        assert_eq!(event.direction, AbsorptionDirection::Bullish);
        assert!(event.strength > 0.5);
        assert!(event.slope_ratio < 0.3);
    }

    #[test]
    fn bearish_absorption_detected() {
        let prices = vec![100.0; 10];
        let cvd: Vec<f64> = (0..10).map(|i| 100.0 * i as f64).collect();

        let detector = AbsorptionDetector::new(10);
        let event = detector.detect(&prices, &cvd).expect("absorption expected");
        assert_eq!(event.direction, AbsorptionDirection::Bearish);
    }

    #[test]
    fn trending_price_not_absorption() {
        // Price follows CVD — ordinary trend, not absorption.
        let prices: Vec<f64> = (0..10).map(|i| 100.0 + 5.0 * i as f64).collect();
        let cvd: Vec<f64> = (0..10).map(|i| 100.0 * i as f64).collect();

        let detector = AbsorptionDetector::new(10);
        assert!(detector.detect(&prices, &cvd).is_none());
    }

    #[test]
    fn quiet_cvd_not_absorption() {
        let prices = vec![100.0; 10];
        let cvd = vec![1000.0; 10];
        let detector = AbsorptionDetector::new(10);
        assert!(detector.detect(&prices, &cvd).is_none());
    }
}
