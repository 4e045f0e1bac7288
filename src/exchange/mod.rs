// =============================================================================
// Exchange clients — HMAC-SHA256 signed Binance REST access
// =============================================================================
//
// SECURITY: secret keys are used exclusively for request signing and are never
// logged or serialized. Signed requests carry X-MBX-APIKEY as a header and a
// recvWindow of 5 000 ms to tolerate minor clock drift.
// =============================================================================

pub mod futures;
pub mod spot;

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// recv-window sent with every signed request (milliseconds).
pub(crate) const RECV_WINDOW: u64 = 5000;

/// Retries for idempotent (read-side) requests.
pub(crate) const READ_RETRIES: u32 = 3;

/// Base back-off for retried reads: 1 s × 2^attempt.
pub(crate) const RETRY_BASE_SECS: u64 = 1;

/// HMAC-SHA256 hex signature of `query` under `secret`.
pub(crate) fn sign(secret: &str, query: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Current UNIX timestamp in milliseconds.
pub(crate) fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

/// Build the full query string for a signed request (appends timestamp,
/// recvWindow, and signature).
pub(crate) fn signed_query(secret: &str, params: &str) -> String {
    let ts = timestamp_ms();
    let base = if params.is_empty() {
        format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
    } else {
        format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
    };
    let sig = sign(secret, &base);
    format!("{base}&signature={sig}")
}

/// Slash-form symbol ("BTC/USDT") → exchange-native ("BTCUSDT").
pub(crate) fn to_native(symbol: &str) -> String {
    symbol.replace('/', "")
}

/// Exchange-native symbol → slash form, assuming a USDT/USDC/BUSD/FDUSD quote.
pub(crate) fn from_native(native: &str) -> String {
    for quote in ["USDT", "USDC", "BUSD", "FDUSD"] {
        if let Some(base) = native.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}/{quote}");
            }
        }
    }
    native.to_string()
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

/// Lenient variant: missing / malformed values collapse to 0.0.
pub(crate) fn str_f64_or_zero(val: &serde_json::Value) -> f64 {
    parse_str_f64(val).unwrap_or(0.0)
}

/// True if a Binance error body represents a non-retryable auth failure.
pub(crate) fn is_auth_error(status: reqwest::StatusCode, body: &serde_json::Value) -> bool {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return true;
    }
    // -2014 bad API key format, -2015 invalid key / IP / permissions.
    matches!(body.get("code").and_then(|c| c.as_i64()), Some(-2014 | -2015))
}

/// True for transient conditions worth a retry: rate limits and 5xx.
pub(crate) fn is_transient(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 418
        || status.is_server_error()
}

/// Round a quantity DOWN to the exchange step size.
pub(crate) fn round_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

/// Round a price to the nearest tick.
pub(crate) fn round_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    (price / tick).round() * tick
}

/// Symbol trading filters extracted from exchangeInfo.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolFilters {
    pub step_size: f64,
    pub tick_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
}

/// Pull LOT_SIZE / PRICE_FILTER / NOTIONAL filters out of a symbol-info entry.
pub(crate) fn parse_filters(info: &serde_json::Value) -> SymbolFilters {
    let mut f = SymbolFilters::default();
    if let Some(filters) = info.get("filters").and_then(|v| v.as_array()) {
        for entry in filters {
            match entry.get("filterType").and_then(|v| v.as_str()) {
                Some("LOT_SIZE") | Some("MARKET_LOT_SIZE") => {
                    let step = str_f64_or_zero(&entry["stepSize"]);
                    let min = str_f64_or_zero(&entry["minQty"]);
                    if f.step_size == 0.0 {
                        f.step_size = step;
                    }
                    if f.min_qty == 0.0 {
                        f.min_qty = min;
                    }
                }
                Some("PRICE_FILTER") => {
                    f.tick_size = str_f64_or_zero(&entry["tickSize"]);
                }
                Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                    let min = entry
                        .get("minNotional")
                        .or_else(|| entry.get("notional"))
                        .map(str_f64_or_zero)
                        .unwrap_or(0.0);
                    if f.min_notional == 0.0 {
                        f.min_notional = min;
                    }
                }
                _ => {}
            }
        }
    }
    f
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_mapping_roundtrip() {
        assert_eq!(to_native("BTC/USDT"), "BTCUSDT");
        assert_eq!(from_native("BTCUSDT"), "BTC/USDT");
        assert_eq!(from_native("PAXGUSDT"), "PAXG/USDT");
        assert_eq!(from_native("WEIRD"), "WEIRD");
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let sig = sign("secret", "symbol=BTCUSDT&side=BUY");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, sign("secret", "symbol=BTCUSDT&side=BUY"));
        assert_ne!(sig, sign("other", "symbol=BTCUSDT&side=BUY"));
    }

    #[test]
    fn signed_query_contains_parts() {
        let qs = signed_query("secret", "symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000&"));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn str_or_num_parsing() {
        assert!((parse_str_f64(&serde_json::json!("1.25")).unwrap() - 1.25).abs() < 1e-12);
        assert!((parse_str_f64(&serde_json::json!(2.5)).unwrap() - 2.5).abs() < 1e-12);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
        assert!((str_f64_or_zero(&serde_json::json!(null))).abs() < f64::EPSILON);
    }

    #[test]
    fn rounding_helpers() {
        assert!((round_step(0.123456, 0.001) - 0.123).abs() < 1e-12);
        assert!((round_step(5.0, 0.0) - 5.0).abs() < f64::EPSILON);
        assert!((round_tick(100.237, 0.01) - 100.24).abs() < 1e-9);
    }

    #[test]
    fn filter_parsing() {
        let info = serde_json::json!({
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.01"},
                {"filterType": "LOT_SIZE", "stepSize": "0.0001", "minQty": "0.0001"},
                {"filterType": "NOTIONAL", "minNotional": "5"}
            ]
        });
        let f = parse_filters(&info);
        assert!((f.tick_size - 0.01).abs() < 1e-12);
        assert!((f.step_size - 0.0001).abs() < 1e-12);
        assert!((f.min_qty - 0.0001).abs() < 1e-12);
        assert!((f.min_notional - 5.0).abs() < 1e-12);
    }

    #[test]
    fn auth_error_detection() {
        let body = serde_json::json!({"code": -2015, "msg": "Invalid API-key"});
        assert!(is_auth_error(reqwest::StatusCode::BAD_REQUEST, &body));
        assert!(is_auth_error(reqwest::StatusCode::UNAUTHORIZED, &serde_json::json!({})));
        assert!(!is_auth_error(
            reqwest::StatusCode::BAD_REQUEST,
            &serde_json::json!({"code": -1013})
        ));
    }
}
