// =============================================================================
// Data Fetcher — OHLCV access with a short-TTL memory cache
// =============================================================================
//
// One fetcher instance per market (spot / futures). The cache is keyed on
// (symbol, timeframe) and exists so that several strategies sharing a
// timeframe within one cycle hit the exchange once.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::debug;

use crate::data::models::Candle;
use crate::exchange::futures::FuturesClient;
use crate::exchange::spot::SpotClient;

/// The market this fetcher reads from.
#[derive(Clone)]
pub enum MarketClient {
    Spot(Arc<SpotClient>),
    Futures(Arc<FuturesClient>),
}

impl MarketClient {
    pub async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        match self {
            Self::Spot(c) => c.get_ohlcv(symbol, timeframe, limit, None).await,
            Self::Futures(c) => c.get_ohlcv(symbol, timeframe, limit, None).await,
        }
    }
}

pub struct DataFetcher {
    client: MarketClient,
    cache: Mutex<HashMap<String, (Vec<Candle>, Instant)>>,
}

impl DataFetcher {
    pub fn new(client: MarketClient) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the latest candles. With `cache_ttl > 0` a recent result for the
    /// same (symbol, timeframe) is reused; expired entries are evicted.
    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        cache_ttl: Duration,
    ) -> Result<Vec<Candle>> {
        let key = format!("{symbol}|{timeframe}");

        if !cache_ttl.is_zero() {
            let mut cache = self.cache.lock();
            cache.retain(|_, (_, at)| at.elapsed() < cache_ttl);
            if let Some((candles, _)) = cache.get(&key) {
                debug!(symbol, timeframe, "OHLCV cache hit");
                return Ok(candles.clone());
            }
        }

        debug!(symbol, timeframe, limit, "fetching OHLCV");
        let candles = self.client.get_ohlcv(symbol, timeframe, limit).await?;

        if !cache_ttl.is_zero() {
            self.cache
                .lock()
                .insert(key, (candles.clone(), Instant::now()));
        }
        Ok(candles)
    }

    /// Drop every cached series (used after a strategy hot-reload).
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // Network-free check of the eviction logic: the cache map itself.
    #[test]
    fn cache_retain_evicts_expired() {
        let mut cache: HashMap<String, (Vec<Candle>, Instant)> = HashMap::new();
        cache.insert("a".into(), (Vec::new(), Instant::now()));
        let old = Instant::now() - Duration::from_secs(120);
        cache.insert("b".into(), (Vec::new(), old));

        let ttl = Duration::from_secs(30);
        cache.retain(|_, (_, at)| at.elapsed() < ttl);
        assert!(cache.contains_key("a"));
        assert!(!cache.contains_key("b"));
    }
}
