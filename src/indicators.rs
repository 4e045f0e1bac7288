// =============================================================================
// Shared technical indicators — used by the risk managers and the MTF summary
// =============================================================================

use std::collections::BTreeMap;

use crate::data::models::Candle;
use crate::orderflow::sfp::SwingDetector;

// ---------------------------------------------------------------------------
// ATR (Average True Range)
// ---------------------------------------------------------------------------

/// Latest ATR over `period` bars; 0.0 when there is not enough data.
pub fn compute_atr(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period + 1 {
        return 0.0;
    }

    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    for w in candles.windows(2) {
        let prev_close = w[0].close;
        let c = &w[1];
        let tr = (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs());
        true_ranges.push(tr);
    }

    let window = &true_ranges[true_ranges.len() - period..];
    window.iter().sum::<f64>() / period as f64
}

// ---------------------------------------------------------------------------
// Simple / exponential moving averages
// ---------------------------------------------------------------------------

/// Rolling SMA; entries before the window fills are `None`.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = Some(sum / period as f64);
    }
    out
}

/// Wilder-smoothed RSI; entries before the window fills are `None`.
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() <= period {
        return out;
    }

    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for i in 1..=period {
        let change = values[i] - values[i - 1];
        if change >= 0.0 {
            gain_sum += change;
        } else {
            loss_sum -= change;
        }
    }
    let mut avg_gain = gain_sum / period as f64;
    let mut avg_loss = loss_sum / period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..values.len() {
        let change = values[i] - values[i - 1];
        let (gain, loss) = if change >= 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

// ---------------------------------------------------------------------------
// Bollinger Bands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct BollingerBands {
    pub upper: f64,
    pub mid: f64,
    pub lower: f64,
    /// Position of the last close within the bands (0 = lower, 1 = upper).
    pub pct_b: f64,
}

pub fn compute_bollinger(closes: &[f64], period: usize, std_dev: f64) -> Option<BollingerBands> {
    if period < 2 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let mid = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|v| (v - mid).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();

    let upper = mid + std_dev * sd;
    let lower = mid - std_dev * sd;
    let last = *closes.last()?;
    let width = upper - lower;
    let pct_b = if width > 0.0 { (last - lower) / width } else { 0.5 };

    Some(BollingerBands { upper, mid, lower, pct_b })
}

// ---------------------------------------------------------------------------
// Fibonacci retracement
// ---------------------------------------------------------------------------

/// Retracement levels between the most recent swing high/low pair.
/// Keys are the ratio strings ("0.236", ...) plus "swing_high"/"swing_low".
pub fn compute_fibonacci_levels(
    candles: &[Candle],
    swing_lookback: usize,
) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    if candles.len() < swing_lookback * 2 + 2 {
        return out;
    }

    let detector = SwingDetector::new(swing_lookback);
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();

    let swing_highs = detector.find_swing_highs(&highs);
    let swing_lows = detector.find_swing_lows(&lows);
    if swing_highs.is_empty() || swing_lows.is_empty() {
        return out;
    }

    let start_h = swing_highs.len().saturating_sub(5);
    let start_l = swing_lows.len().saturating_sub(5);
    let sh = swing_highs[start_h..]
        .iter()
        .map(|&(_, p)| p)
        .fold(f64::MIN, f64::max);
    let sl = swing_lows[start_l..]
        .iter()
        .map(|&(_, p)| p)
        .fold(f64::MAX, f64::min);
    if sh <= sl {
        return out;
    }

    let diff = sh - sl;
    out.insert("swing_high".into(), sh);
    out.insert("swing_low".into(), sl);
    for ratio in [0.236, 0.382, 0.5, 0.618, 0.786] {
        out.insert(format!("{ratio:.3}"), sh - diff * ratio);
    }
    out
}

// ---------------------------------------------------------------------------
// Support / resistance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SupportResistance {
    /// Swing lows below the current price, nearest first.
    pub support: Vec<f64>,
    /// Swing highs above the current price, nearest first.
    pub resistance: Vec<f64>,
}

pub fn compute_support_resistance(
    candles: &[Candle],
    swing_lookback: usize,
    max_levels: usize,
) -> SupportResistance {
    if candles.len() < swing_lookback * 2 + 2 {
        return SupportResistance::default();
    }

    let detector = SwingDetector::new(swing_lookback);
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let current = candles.last().map(|c| c.close).unwrap_or(0.0);

    let mut resistance: Vec<f64> = detector
        .find_swing_highs(&highs)
        .into_iter()
        .map(|(_, p)| p)
        .filter(|&p| p > current)
        .collect();
    resistance.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    resistance.dedup();
    resistance.truncate(max_levels);

    let mut support: Vec<f64> = detector
        .find_swing_lows(&lows)
        .into_iter()
        .map(|(_, p)| p)
        .filter(|&p| p < current)
        .collect();
    support.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    support.dedup();
    support.truncate(max_levels);

    SupportResistance { support, resistance }
}

// ---------------------------------------------------------------------------
// Multi-timeframe trend summary
// ---------------------------------------------------------------------------

/// Compact per-timeframe state handed to the LLM.
#[derive(Debug, Clone)]
pub struct TimeframeSummary {
    pub timeframe: String,
    pub close: f64,
    pub trend: &'static str,
    pub rsi_14: Option<f64>,
    pub sma_20: Option<f64>,
    pub bb_pct_b: Option<f64>,
    pub change_pct: f64,
}

/// Classify one timeframe: trend from close vs SMA(20) and the last 10-bar
/// drift, plus RSI and Bollinger position.
pub fn compute_timeframe_summary(candles: &[Candle], timeframe: &str) -> Option<TimeframeSummary> {
    if candles.len() < 21 {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let close = *closes.last()?;

    let sma_20 = sma(&closes, 20).last().copied().flatten();
    let rsi_14 = rsi(&closes, 14).last().copied().flatten();
    let bb = compute_bollinger(&closes, 20, 2.0);

    let back = closes[closes.len() - 11];
    let change_pct = if back > 0.0 { (close - back) / back * 100.0 } else { 0.0 };

    let trend = match sma_20 {
        Some(s) if close > s && change_pct > 0.2 => "up",
        Some(s) if close < s && change_pct < -0.2 => "down",
        _ => "flat",
    };

    Some(TimeframeSummary {
        timeframe: timeframe.to_string(),
        close,
        trend,
        rsi_14,
        sma_20,
        bb_pct_b: bb.map(|b| b.pct_b),
        change_pct,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn flat_candles(n: usize, price: f64, range: f64) -> Vec<Candle> {
        (0..n)
            .map(|_| candle(price, price + range, price - range, price))
            .collect()
    }

    #[test]
    fn atr_on_flat_range() {
        // Constant 2.0 high-low range, no gaps: ATR == 2.0.
        let candles = flat_candles(20, 100.0, 1.0);
        let atr = compute_atr(&candles, 14);
        assert!((atr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_insufficient_data_is_zero() {
        let candles = flat_candles(10, 100.0, 1.0);
        assert!((compute_atr(&candles, 14)).abs() < f64::EPSILON);
    }

    #[test]
    fn sma_window() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let out = sma(&values, 3);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert!((out[2].unwrap() - 2.0).abs() < 1e-12);
        assert!((out[4].unwrap() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn rsi_bounds() {
        let rising: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let out = rsi(&rising, 14);
        let last = out.last().unwrap().unwrap();
        assert!(last > 95.0);

        let falling: Vec<f64> = (1..=30).rev().map(|i| i as f64).collect();
        let out = rsi(&falling, 14);
        let last = out.last().unwrap().unwrap();
        assert!(last < 5.0);
    }

    #[test]
    fn bollinger_flat_series() {
        let closes = vec![100.0; 25];
        let bb = compute_bollinger(&closes, 20, 2.0).unwrap();
        assert!((bb.mid - 100.0).abs() < 1e-12);
        assert!((bb.upper - 100.0).abs() < 1e-12);
        assert!((bb.pct_b - 0.5).abs() < 1e-12);
    }

    #[test]
    fn support_resistance_brackets_price() {
        // V-shape with the close in the middle.
        let mut candles = Vec::new();
        for i in 0..15 {
            let p = 110.0 - i as f64;
            candles.push(candle(p, p + 0.5, p - 0.5, p));
        }
        for i in 0..15 {
            let p = 96.0 + i as f64 * 0.5;
            candles.push(candle(p, p + 0.5, p - 0.5, p));
        }
        let sr = compute_support_resistance(&candles, 5, 3);
        let current = candles.last().unwrap().close;
        for s in &sr.support {
            assert!(*s < current);
        }
        for r in &sr.resistance {
            assert!(*r > current);
        }
    }

    #[test]
    fn fibonacci_levels_ordered() {
        let mut candles = Vec::new();
        // Swing low around 90, swing high around 110.
        for i in 0..12 {
            let p = 90.0 + i as f64 * 2.0;
            candles.push(candle(p, p + 1.0, p - 1.0, p));
        }
        for i in 0..12 {
            let p = 112.0 - i as f64;
            candles.push(candle(p, p + 1.0, p - 1.0, p));
        }
        let fib = compute_fibonacci_levels(&candles, 5);
        if !fib.is_empty() {
            let sh = fib["swing_high"];
            let sl = fib["swing_low"];
            assert!(sh > sl);
            let l382 = fib["0.382"];
            let l618 = fib["0.618"];
            assert!(l382 > l618);
            assert!(l382 < sh && l618 > sl);
        }
    }

    #[test]
    fn timeframe_summary_trend_up() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let p = 100.0 + i as f64;
                candle(p, p + 0.5, p - 0.5, p)
            })
            .collect();
        let s = compute_timeframe_summary(&candles, "1h").unwrap();
        assert_eq!(s.trend, "up");
        assert!(s.change_pct > 0.0);
        assert!(s.rsi_14.unwrap() > 60.0);
    }
}
