// =============================================================================
// Trapped-trader analysis — high-volume entries reversed against
// =============================================================================
//
// A bar with well-above-average volume marks a crowd entering; if the next
// bars reverse, that crowd is trapped and its stop cluster acts as a price
// magnet.
// =============================================================================

use crate::data::models::OrderFlowBar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrappedSide {
    /// Longs trapped → bearish pressure.
    TrappedLongs,
    /// Shorts trapped → bullish pressure.
    TrappedShorts,
}

#[derive(Debug, Clone)]
pub struct TrappedTraderEvent {
    pub side: TrappedSide,
    pub trap_price: f64,
    pub volume_at_trap: f64,
    pub strength: f64,
    pub bar_index: usize,
    /// Stop cluster of the trapped side.
    pub magnet_price: f64,
}

pub struct TrappedTraderAnalyzer {
    volume_lookback: usize,
    volume_threshold: f64,
    reversal_bars: usize,
}

impl Default for TrappedTraderAnalyzer {
    fn default() -> Self {
        Self {
            volume_lookback: 20,
            volume_threshold: 1.5,
            reversal_bars: 3,
        }
    }
}

impl TrappedTraderAnalyzer {
    pub fn detect(&self, bars: &[OrderFlowBar]) -> Vec<TrappedTraderEvent> {
        if bars.len() < self.volume_lookback + self.reversal_bars + 1 {
            return Vec::new();
        }
        let mut results = Vec::new();

        for i in self.volume_lookback..bars.len() - self.reversal_bars {
            let bar = &bars[i];
            let avg_vol: f64 = bars[i - self.volume_lookback..i]
                .iter()
                .map(|b| b.volume)
                .sum::<f64>()
                / self.volume_lookback as f64;
            if avg_vol == 0.0 {
                continue;
            }
            let vol_ratio = bar.volume / avg_vol;
            if vol_ratio < self.volume_threshold {
                continue;
            }

            let is_bullish_bar = bar.close > bar.open;
            let following = &bars[i + 1..i + 1 + self.reversal_bars];
            let strength = (vol_ratio / (self.volume_threshold * 2.0)).min(1.0);

            if is_bullish_bar {
                // Buyers piled in; did the market turn down on them?
                let reversals = following.iter().filter(|b| b.close < b.open).count();
                if reversals >= self.reversal_bars - 1 {
                    results.push(TrappedTraderEvent {
                        side: TrappedSide::TrappedLongs,
                        trap_price: bar.close,
                        volume_at_trap: bar.volume,
                        strength,
                        bar_index: i,
                        magnet_price: bar.low,
                    });
                }
            } else {
                let reversals = following.iter().filter(|b| b.close > b.open).count();
                if reversals >= self.reversal_bars - 1 {
                    results.push(TrappedTraderEvent {
                        side: TrappedSide::TrappedShorts,
                        trap_price: bar.close,
                        volume_at_trap: bar.volume,
                        strength,
                        bar_index: i,
                        magnet_price: bar.high,
                    });
                }
            }
        }

        results
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, close: f64, volume: f64) -> OrderFlowBar {
        OrderFlowBar {
            open_time: 0,
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            close,
            volume,
            buy_volume: volume / 2.0,
            sell_volume: volume / 2.0,
            trade_count: 1,
            vwap: (open + close) / 2.0,
            footprint: Default::default(),
        }
    }

    #[test]
    fn trapped_longs_detected() {
        let mut bars = Vec::new();
        // 20 quiet bars.
        for _ in 0..20 {
            bars.push(bar(100.0, 100.2, 10.0));
        }
        // High-volume bullish bar, then three bearish bars.
        bars.push(bar(100.0, 101.0, 40.0));
        bars.push(bar(101.0, 100.2, 12.0));
        bars.push(bar(100.2, 99.5, 11.0));
        bars.push(bar(99.5, 99.0, 10.0));

        let analyzer = TrappedTraderAnalyzer::default();
        let events = analyzer.detect(&bars);
        let trapped: Vec<_> = events
            .iter()
            .filter(|e| e.side == TrappedSide::TrappedLongs)
            .collect();
        assert!(!trapped.is_empty());
        let ev = trapped[0];
        assert_eq!(ev.bar_index, 20);
        // Magnet sits at the trap bar's low (long stop cluster).
        assert!(ev.magnet_price < ev.trap_price);
        assert!(ev.strength > 0.0 && ev.strength <= 1.0);
    }

    #[test]
    fn trapped_shorts_detected() {
        let mut bars = Vec::new();
        for _ in 0..20 {
            bars.push(bar(100.0, 99.8, 10.0));
        }
        bars.push(bar(100.0, 99.0, 50.0));
        bars.push(bar(99.0, 99.8, 12.0));
        bars.push(bar(99.8, 100.5, 11.0));
        bars.push(bar(100.5, 101.0, 10.0));

        let analyzer = TrappedTraderAnalyzer::default();
        let events = analyzer.detect(&bars);
        assert!(events.iter().any(|e| e.side == TrappedSide::TrappedShorts));
    }

    #[test]
    fn normal_volume_no_event() {
        let bars: Vec<OrderFlowBar> = (0..30).map(|_| bar(100.0, 100.1, 10.0)).collect();
        let analyzer = TrappedTraderAnalyzer::default();
        assert!(analyzer.detect(&bars).is_empty());
    }
}
