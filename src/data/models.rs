// =============================================================================
// Market data models
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single OHLCV candle. `open_time` is milliseconds since the epoch (UTC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Ticker snapshot from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub timestamp: i64,
}

/// A single aggregated trade (Binance aggTrade).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggTrade {
    pub trade_id: i64,
    pub price: f64,
    pub quantity: f64,
    /// Milliseconds since the epoch (UTC).
    pub timestamp: i64,
    pub is_buyer_maker: bool,
}

/// Buy/sell volume at a single footprint price level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FootprintLevel {
    pub price: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

impl FootprintLevel {
    pub fn delta(&self) -> f64 {
        self.buy_volume - self.sell_volume
    }
}

/// An order-flow bar: OHLCV plus taker buy/sell split, VWAP and footprint.
///
/// The footprint map is keyed by the price level scaled to integer ticks so
/// it can be ordered and hashed without touching float equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFlowBar {
    /// Bar open time, milliseconds since the epoch (UTC).
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub trade_count: u64,
    pub vwap: f64,
    /// price-in-ticks → level. Excluded from the persisted cache blob.
    #[serde(skip)]
    pub footprint: BTreeMap<i64, FootprintLevel>,
}

impl OrderFlowBar {
    /// Net taker pressure = buy_volume - sell_volume.
    pub fn delta(&self) -> f64 {
        self.buy_volume - self.sell_volume
    }

    /// Delta as a fraction of total volume.
    pub fn delta_pct(&self) -> f64 {
        if self.volume == 0.0 {
            0.0
        } else {
            self.delta() / self.volume
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_delta() {
        let bar = OrderFlowBar {
            open_time: 0,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            buy_volume: 7.0,
            sell_volume: 3.0,
            trade_count: 5,
            vwap: 1.2,
            footprint: BTreeMap::new(),
        };
        assert!((bar.delta() - 4.0).abs() < f64::EPSILON);
        assert!((bar.delta_pct() - 0.4).abs() < f64::EPSILON);
    }
}
