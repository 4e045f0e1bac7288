// =============================================================================
// Bar Aggregator — aggTrade stream → OrderFlowBar
// =============================================================================
//
// Trades are bucketed into fixed time windows. A bar closes when the first
// trade of the next window arrives; `flush` force-closes the current bar
// (used at shutdown and when a stream drops).
// =============================================================================

use std::collections::BTreeMap;

use crate::data::models::{AggTrade, FootprintLevel, OrderFlowBar};

pub struct BarAggregator {
    interval_ms: i64,
    tick_size: f64,
    trades: Vec<AggTrade>,
    bar_open_time: Option<i64>,
}

impl BarAggregator {
    pub fn new(interval_seconds: u64, tick_size: f64) -> Self {
        Self {
            interval_ms: (interval_seconds.max(1) as i64) * 1000,
            tick_size,
            trades: Vec::new(),
            bar_open_time: None,
        }
    }

    /// Align a millisecond timestamp to its bar open time.
    fn bar_open(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.interval_ms) * self.interval_ms
    }

    /// Price level in integer ticks (footprint key).
    fn price_ticks(&self, price: f64) -> i64 {
        if self.tick_size <= 0.0 {
            return price.round() as i64;
        }
        (price / self.tick_size).round() as i64
    }

    /// Feed one trade. Returns the completed bar when this trade opens the
    /// next window, otherwise `None`.
    pub fn add_trade(&mut self, trade: AggTrade) -> Option<OrderFlowBar> {
        let open = self.bar_open(trade.timestamp);

        match self.bar_open_time {
            None => {
                self.bar_open_time = Some(open);
                self.trades.push(trade);
                None
            }
            Some(current) if open > current && !self.trades.is_empty() => {
                let bar = self.build_bar(current);
                self.trades.clear();
                self.bar_open_time = Some(open);
                self.trades.push(trade);
                Some(bar)
            }
            Some(_) => {
                self.trades.push(trade);
                None
            }
        }
    }

    /// Force-close the in-progress bar, if any.
    pub fn flush(&mut self) -> Option<OrderFlowBar> {
        if self.trades.is_empty() {
            return None;
        }
        let open = self.bar_open_time.unwrap_or(0);
        let bar = self.build_bar(open);
        self.trades.clear();
        self.bar_open_time = None;
        Some(bar)
    }

    fn build_bar(&self, open_time: i64) -> OrderFlowBar {
        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        let mut total_pv = 0.0;
        let mut total_vol = 0.0;
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut footprint: BTreeMap<i64, FootprintLevel> = BTreeMap::new();

        for t in &self.trades {
            total_pv += t.price * t.quantity;
            total_vol += t.quantity;
            high = high.max(t.price);
            low = low.min(t.price);

            if t.is_buyer_maker {
                sell_volume += t.quantity;
            } else {
                buy_volume += t.quantity;
            }

            let ticks = self.price_ticks(t.price);
            let level = footprint.entry(ticks).or_insert_with(|| FootprintLevel {
                price: ticks as f64 * self.tick_size,
                ..Default::default()
            });
            if t.is_buyer_maker {
                level.sell_volume += t.quantity;
            } else {
                level.buy_volume += t.quantity;
            }
        }

        let open = self.trades.first().map(|t| t.price).unwrap_or(0.0);
        let close = self.trades.last().map(|t| t.price).unwrap_or(0.0);
        let vwap = if total_vol > 0.0 { total_pv / total_vol } else { open };

        OrderFlowBar {
            open_time,
            open,
            high,
            low,
            close,
            volume: total_vol,
            buy_volume,
            sell_volume,
            trade_count: self.trades.len() as u64,
            vwap,
            footprint,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade(id: i64, price: f64, qty: f64, ts_ms: i64, maker: bool) -> AggTrade {
        AggTrade {
            trade_id: id,
            price,
            quantity: qty,
            timestamp: ts_ms,
            is_buyer_maker: maker,
        }
    }

    #[test]
    fn bar_closes_on_next_window() {
        let mut agg = BarAggregator::new(60, 0.01);
        assert!(agg.add_trade(trade(1, 100.0, 1.0, 0, false)).is_none());
        assert!(agg.add_trade(trade(2, 101.0, 2.0, 30_000, true)).is_none());

        // First trade of the next minute closes the bar.
        let bar = agg.add_trade(trade(3, 102.0, 1.0, 60_000, false)).unwrap();
        assert_eq!(bar.open_time, 0);
        assert!((bar.open - 100.0).abs() < f64::EPSILON);
        assert!((bar.close - 101.0).abs() < f64::EPSILON);
        assert!((bar.high - 101.0).abs() < f64::EPSILON);
        assert!((bar.low - 100.0).abs() < f64::EPSILON);
        assert!((bar.volume - 3.0).abs() < f64::EPSILON);
        assert!((bar.buy_volume - 1.0).abs() < f64::EPSILON);
        assert!((bar.sell_volume - 2.0).abs() < f64::EPSILON);
        assert_eq!(bar.trade_count, 2);
    }

    #[test]
    fn vwap_is_volume_weighted() {
        let mut agg = BarAggregator::new(60, 0.01);
        agg.add_trade(trade(1, 100.0, 1.0, 0, false));
        agg.add_trade(trade(2, 200.0, 3.0, 1_000, false));
        let bar = agg.flush().unwrap();
        // (100*1 + 200*3) / 4 = 175
        assert!((bar.vwap - 175.0).abs() < 1e-9);
    }

    #[test]
    fn volume_invariant_holds() {
        let mut agg = BarAggregator::new(60, 0.01);
        agg.add_trade(trade(1, 100.0, 1.5, 0, false));
        agg.add_trade(trade(2, 100.5, 2.5, 100, true));
        agg.add_trade(trade(3, 99.5, 1.0, 200, true));
        let bar = agg.flush().unwrap();
        assert!((bar.volume - (bar.buy_volume + bar.sell_volume)).abs() < 1e-9);
        assert!(bar.high >= bar.open.max(bar.close));
        assert!(bar.low <= bar.open.min(bar.close));
    }

    #[test]
    fn footprint_accumulates_per_level() {
        let mut agg = BarAggregator::new(60, 0.5);
        agg.add_trade(trade(1, 100.0, 1.0, 0, false));
        agg.add_trade(trade(2, 100.1, 2.0, 100, true)); // rounds to same 0.5 tick
        agg.add_trade(trade(3, 100.5, 1.0, 200, false));
        let bar = agg.flush().unwrap();

        assert_eq!(bar.footprint.len(), 2);
        let first = bar.footprint.get(&200).unwrap(); // 100.0 / 0.5
        assert!((first.buy_volume - 1.0).abs() < f64::EPSILON);
        assert!((first.sell_volume - 2.0).abs() < f64::EPSILON);
        assert!((first.delta() + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flush_empty_returns_none() {
        let mut agg = BarAggregator::new(60, 0.01);
        assert!(agg.flush().is_none());
    }
}
