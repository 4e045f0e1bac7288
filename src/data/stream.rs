// =============================================================================
// aggTrade WebSocket stream — drives the run-async order-flow variant
// =============================================================================
//
// Connects to the single-symbol aggTrade stream and forwards parsed trades to
// the caller's channel. Runs until the stream disconnects or errors, then
// returns so the caller can reconnect with back-off.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::data::models::AggTrade;

pub async fn run_agg_trade_stream(
    symbol: &str,
    tx: &mpsc::Sender<AggTrade>,
) -> Result<()> {
    let lower = symbol.replace('/', "").to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@aggTrade");
    info!(url = %url, symbol = %symbol, "connecting to aggTrade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to aggTrade WebSocket")?;

    info!(symbol = %symbol, "aggTrade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_agg_trade(&text) {
                        Ok(trade) => {
                            if tx.send(trade).await.is_err() {
                                // Receiver gone — shut the stream down.
                                return Ok(());
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to parse aggTrade message"),
                    }
                }
                // Ping/pong/binary/close frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "aggTrade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "aggTrade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance aggTrade payload.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "a": 12345, "p": "37000.00", "q": "0.123",
///   "T": 1700000000000, "m": true }
/// ```
fn parse_agg_trade(text: &str) -> Result<AggTrade> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;
    let quantity: f64 = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    Ok(AggTrade {
        trade_id: root["a"].as_i64().context("missing field a")?,
        price,
        quantity,
        timestamp: root["T"].as_i64().context("missing field T")?,
        is_buyer_maker: root["m"].as_bool().context("missing field m")?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_agg_trade_ok() {
        let json = r#"{
            "e": "aggTrade", "E": 1700000000100, "s": "BTCUSDT",
            "a": 987654, "p": "37000.50", "q": "0.250",
            "f": 1, "l": 3, "T": 1700000000000, "m": true
        }"#;
        let trade = parse_agg_trade(json).expect("should parse");
        assert_eq!(trade.trade_id, 987654);
        assert!((trade.price - 37000.5).abs() < f64::EPSILON);
        assert!((trade.quantity - 0.25).abs() < f64::EPSILON);
        assert_eq!(trade.timestamp, 1700000000000);
        assert!(trade.is_buyer_maker);
    }

    #[test]
    fn parse_agg_trade_missing_field() {
        assert!(parse_agg_trade(r#"{"e":"aggTrade","p":"1.0"}"#).is_err());
        assert!(parse_agg_trade("not json").is_err());
    }
}
