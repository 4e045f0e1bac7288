// =============================================================================
// Persistence sink — PostgREST-style data layer between the bot and dashboards
// =============================================================================
//
// The bot is the only writer. Positions use idempotent upserts keyed on
// (symbol, mode, market_type, side); everything else is append-only
// projection. Only positions are read back at boot (restart rehydration) plus
// the last cycle number and the newest config version.
//
// Persistence never blocks trading: every failure is logged at debug and
// swallowed. With SINK_URL / SINK_SERVICE_KEY unset the sink is disabled and
// all calls are no-ops.
//
// Log rows are buffered and flushed every 5 s or 20 entries, whichever comes
// first.
// =============================================================================

use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const LOG_FLUSH_SIZE: usize = 20;

/// A position row loaded for restart rehydration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredPosition {
    pub symbol: String,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub leverage: Option<u32>,
}

struct LogBuffer {
    rows: Vec<serde_json::Value>,
    last_flush: Instant,
    seq: u32,
}

pub struct Sink {
    client: reqwest::Client,
    base_url: String,
    enabled: bool,
    last_config_version: Mutex<i64>,
    logs: Mutex<LogBuffer>,
}

impl Sink {
    /// Build from SINK_URL / SINK_SERVICE_KEY. Missing credentials disable
    /// the sink (every call becomes a no-op).
    pub fn from_env() -> Self {
        let url = std::env::var("SINK_URL").unwrap_or_default();
        let key = std::env::var("SINK_SERVICE_KEY").unwrap_or_default();
        let enabled = !url.is_empty() && !key.is_empty();

        let mut headers = reqwest::header::HeaderMap::new();
        if enabled {
            if let Ok(val) = reqwest::header::HeaderValue::from_str(&key) {
                headers.insert("apikey", val);
            }
            if let Ok(val) = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(reqwest::header::AUTHORIZATION, val);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        if enabled {
            info!(url = %url, "persistence sink connected");
        } else {
            warn!("SINK_URL / SINK_SERVICE_KEY unset — persistence disabled");
        }

        Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            enabled,
            last_config_version: Mutex::new(-1),
            logs: Mutex::new(LogBuffer {
                rows: Vec::new(),
                last_flush: Instant::now(),
                seq: 0,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    /// Fire-and-forget insert. Failures are logged at debug only.
    async fn insert(&self, table: &str, body: serde_json::Value) {
        if !self.enabled {
            return;
        }
        let result = self
            .client
            .post(self.table_url(table))
            .json(&body)
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                debug!(table, status = %resp.status(), "sink insert rejected");
            }
            Err(e) => debug!(table, error = %e, "sink insert failed"),
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Config
    // -------------------------------------------------------------------------

    /// Newest config JSON, or None when the version has not advanced since
    /// the last call.
    pub async fn load_config(&self) -> Option<serde_json::Value> {
        if !self.enabled {
            return None;
        }
        let url = format!(
            "{}?select=version,config_json&order=version.desc&limit=1",
            self.table_url("bot_config")
        );
        let rows: Vec<serde_json::Value> = match self.client.get(&url).send().await {
            Ok(resp) => resp.json().await.ok()?,
            Err(e) => {
                debug!(error = %e, "bot_config read failed");
                return None;
            }
        };
        let row = rows.first()?;
        let version = row["version"].as_i64()?;

        let mut last = self.last_config_version.lock();
        if version == *last {
            return None;
        }
        *last = version;
        info!(version, "new config version loaded from sink");
        row.get("config_json").cloned()
    }

    /// Push a local config as a new version (config-push CLI).
    pub async fn push_config(&self, config_json: serde_json::Value, note: &str) {
        self.insert(
            "bot_config",
            json!({ "config_json": config_json, "note": note }),
        )
        .await;
    }

    pub fn last_config_version(&self) -> i64 {
        *self.last_config_version.lock()
    }

    // -------------------------------------------------------------------------
    // Verdicts / decisions / orders
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_verdict(
        &self,
        symbol: &str,
        strategy: &str,
        signal: &str,
        confidence: f64,
        reasoning: &str,
        cycle_id: &str,
        market_type: &str,
        timeframe: &str,
    ) {
        self.insert(
            "strategy_verdicts",
            json!({
                "symbol": symbol,
                "strategy": strategy,
                "signal": signal,
                "confidence": confidence,
                "reasoning": clip(reasoning, 500),
                "cycle_id": cycle_id,
                "market_type": market_type,
                "timeframe": timeframe,
            }),
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_llm_decision(
        &self,
        symbol: &str,
        action: &str,
        confidence: f64,
        reasoning: &str,
        model: &str,
        cycle_id: &str,
        market_type: &str,
    ) {
        self.insert(
            "llm_decisions",
            json!({
                "symbol": symbol,
                "action": action,
                "confidence": confidence,
                "reasoning": clip(reasoning, 1000),
                "model": model,
                "cycle_id": cycle_id,
                "market_type": market_type,
            }),
        )
        .await;
    }

    pub async fn insert_order(
        &self,
        order: &serde_json::Value,
        mode: &str,
        cycle_id: &str,
        market_type: &str,
        position_side: Option<&str>,
        leverage: u32,
        reduce_only: bool,
    ) {
        self.insert(
            "orders",
            json!({
                "order_id": order["id"],
                "symbol": order["symbol"],
                "side": order["side"],
                "order_type": order["type"],
                "amount": order["amount"],
                "filled": order["filled"],
                "price": order["price"],
                "status": order["status"],
                "mode": mode,
                "cycle_id": cycle_id,
                "market_type": market_type,
                "position_side": position_side,
                "leverage": leverage,
                "reduce_only": reduce_only,
            }),
        )
        .await;
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Idempotent upsert keyed on (symbol, mode, market_type, side).
    pub async fn upsert_position(
        &self,
        symbol: &str,
        mut data: serde_json::Value,
        mode: &str,
        market_type: &str,
    ) {
        if !self.enabled {
            return;
        }
        if let Some(obj) = data.as_object_mut() {
            obj.insert("symbol".into(), json!(symbol));
            obj.insert("mode".into(), json!(mode));
            obj.insert("market_type".into(), json!(market_type));
            obj.entry("side").or_insert(json!("long"));
            obj.insert("updated_at".into(), json!(Utc::now().to_rfc3339()));
        }
        let url = format!(
            "{}?on_conflict=symbol,mode,market_type,side",
            self.table_url("positions")
        );
        let result = self
            .client
            .post(&url)
            .header("Prefer", "resolution=merge-duplicates")
            .json(&data)
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                debug!(symbol, status = %resp.status(), "position upsert rejected");
            }
            Err(e) => debug!(symbol, error = %e, "position upsert failed"),
            _ => {}
        }
    }

    pub async fn load_positions(&self, mode: &str, market_type: &str) -> Vec<StoredPosition> {
        if !self.enabled {
            return Vec::new();
        }
        let url = format!(
            "{}?select=symbol,quantity,entry_price,stop_loss,take_profit,side,leverage&mode=eq.{mode}&market_type=eq.{market_type}",
            self.table_url("positions")
        );
        match self.client.get(&url).send().await {
            Ok(resp) => resp.json().await.unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "positions read failed");
                Vec::new()
            }
        }
    }

    pub async fn delete_position(&self, symbol: &str, mode: &str, market_type: &str, side: &str) {
        if !self.enabled {
            return;
        }
        let url = format!(
            "{}?symbol=eq.{symbol}&mode=eq.{mode}&market_type=eq.{market_type}&side=eq.{side}",
            self.table_url("positions")
        );
        if let Err(e) = self.client.delete(&url).send().await {
            debug!(symbol, error = %e, "position delete failed");
        }
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub async fn insert_market_snapshot(&self, symbol: &str, price: f64, mode: &str) {
        self.insert(
            "market_snapshots",
            json!({ "symbol": symbol, "price": price, "mode": mode }),
        )
        .await;
    }

    pub async fn insert_balances(
        &self,
        balances: &std::collections::HashMap<String, f64>,
        usdt_values: &std::collections::HashMap<String, Option<f64>>,
        snapshot_id: &str,
    ) {
        if !self.enabled || balances.is_empty() {
            return;
        }
        let rows: Vec<serde_json::Value> = balances
            .iter()
            .map(|(currency, free)| {
                json!({
                    "currency": currency,
                    "free": free,
                    "usdt_value": usdt_values.get(currency).copied().flatten().unwrap_or(0.0),
                    "snapshot_id": snapshot_id,
                })
            })
            .collect();
        self.insert("account_balances", json!(rows)).await;
    }

    pub async fn insert_futures_margin(
        &self,
        wallet_balance: f64,
        available_balance: f64,
        unrealized_pnl: f64,
        margin_balance: f64,
        margin_ratio: f64,
    ) {
        self.insert(
            "futures_margin",
            json!({
                "total_wallet_balance": wallet_balance,
                "available_balance": available_balance,
                "total_unrealized_pnl": unrealized_pnl,
                "total_margin_balance": margin_balance,
                "margin_ratio": margin_ratio,
            }),
        )
        .await;
    }

    // -------------------------------------------------------------------------
    // Loan health
    // -------------------------------------------------------------------------

    pub async fn insert_loan_health(&self, loan_data: serde_json::Value) {
        self.insert("loan_health", loan_data).await;
    }

    // -------------------------------------------------------------------------
    // Heartbeat / cycle resume
    // -------------------------------------------------------------------------

    /// Last persisted cycle number; the counter resumes from here on restart.
    pub async fn get_last_cycle_num(&self) -> u64 {
        if !self.enabled {
            return 0;
        }
        let url = format!(
            "{}?select=cycle_num&order=cycle_num.desc&limit=1",
            self.table_url("bot_status")
        );
        let rows: Vec<serde_json::Value> = match self.client.get(&url).send().await {
            Ok(resp) => resp.json().await.unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "bot_status read failed");
                return 0;
            }
        };
        rows.first()
            .and_then(|r| r["cycle_num"].as_u64())
            .unwrap_or(0)
    }

    pub async fn update_bot_status(
        &self,
        cycle_num: u64,
        status: &str,
        config_ver: i64,
        pairs: &[String],
        uptime_sec: u64,
    ) {
        self.insert(
            "bot_status",
            json!({
                "cycle_num": cycle_num,
                "status": status,
                "config_ver": config_ver,
                "pairs": pairs,
                "uptime_sec": uptime_sec,
            }),
        )
        .await;
    }

    // -------------------------------------------------------------------------
    // Buffered logs
    // -------------------------------------------------------------------------

    /// Queue a log row; flushes when the batch or interval threshold is hit.
    pub async fn insert_log(&self, level: &str, module: &str, message: &str) {
        if !self.enabled {
            return;
        }
        let batch = {
            let mut buffer = self.logs.lock();
            buffer.seq = buffer.seq.wrapping_add(1);
            // Millisecond offset keeps same-instant rows ordered downstream.
            let ts = Utc::now() + chrono::Duration::milliseconds((buffer.seq % 1000) as i64);
            buffer.rows.push(json!({
                "level": level,
                "module": module,
                "message": clip(message, 2000),
                "created_at": ts.to_rfc3339(),
            }));

            let due = buffer.rows.len() >= LOG_FLUSH_SIZE
                || buffer.last_flush.elapsed() >= LOG_FLUSH_INTERVAL;
            if due {
                buffer.last_flush = Instant::now();
                std::mem::take(&mut buffer.rows)
            } else {
                Vec::new()
            }
        };
        if !batch.is_empty() {
            self.insert("bot_logs", json!(batch)).await;
        }
    }

    /// Force-drain the log buffer (end of each cycle and at shutdown).
    pub async fn flush_logs(&self) {
        if !self.enabled {
            return;
        }
        let batch = {
            let mut buffer = self.logs.lock();
            buffer.last_flush = Instant::now();
            std::mem::take(&mut buffer.rows)
        };
        if !batch.is_empty() {
            self.insert("bot_logs", json!(batch)).await;
        }
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("base_url", &self.base_url)
            .field("enabled", &self.enabled)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_bounds_message() {
        assert_eq!(clip("short", 10), "short");
        assert_eq!(clip("0123456789abc", 10), "0123456789");
    }

    #[test]
    fn stored_position_tolerates_missing_fields() {
        let row: StoredPosition =
            serde_json::from_value(json!({ "symbol": "BTC/USDT", "quantity": 0.5 })).unwrap();
        assert_eq!(row.symbol, "BTC/USDT");
        assert!((row.quantity - 0.5).abs() < f64::EPSILON);
        assert!(row.side.is_none());
        assert!(row.leverage.is_none());
    }

    #[tokio::test]
    async fn disabled_sink_is_noop() {
        std::env::remove_var("SINK_URL");
        std::env::remove_var("SINK_SERVICE_KEY");
        let sink = Sink::from_env();
        assert!(!sink.enabled());
        assert!(sink.load_config().await.is_none());
        assert!(sink.load_positions("paper", "spot").await.is_empty());
        assert_eq!(sink.get_last_cycle_num().await, 0);
        // Logging into a disabled sink must not accumulate.
        sink.insert_log("info", "test", "message").await;
        assert!(sink.logs.lock().rows.is_empty());
    }
}
