// =============================================================================
// Settings — YAML + environment configuration with hot-reload support
// =============================================================================
//
// `Settings::load` merges `config.yaml` with environment variables (.env is
// loaded by main before this runs). API credentials come exclusively from the
// environment and are never overwritten by a hot-reload: `Settings::from_value`
// rebuilds every other section from the sink's config JSON while carrying the
// existing `ExchangeConfig` forward.
//
// All sections use serde defaults so that a partial YAML file (or an older
// remote config version) still deserialises.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Horizon, TradingMode};

/// Timeframes accepted in config and on the exchange REST API.
pub const VALID_TIMEFRAMES: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

/// Minutes per timeframe; unknown strings map to `None`.
pub fn timeframe_minutes(tf: &str) -> Option<u32> {
    let m = match tf {
        "1m" => 1,
        "3m" => 3,
        "5m" => 5,
        "15m" => 15,
        "30m" => 30,
        "1h" => 60,
        "2h" => 120,
        "4h" => 240,
        "6h" => 360,
        "8h" => 480,
        "12h" => 720,
        "1d" => 1440,
        "3d" => 4320,
        "1w" => 10080,
        "1M" => 43200,
        _ => return None,
    };
    Some(m)
}

// =============================================================================
// Exchange credentials (environment only)
// =============================================================================

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    /// Spot testnet key pair (testnet.binance.vision) — independent system.
    pub testnet_api_key: String,
    pub testnet_api_secret: String,
    /// Futures testnet key pair (testnet.binancefuture.com) — also independent.
    pub futures_api_key: String,
    pub futures_api_secret: String,
}

impl ExchangeConfig {
    fn from_env() -> Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
        if api_key.is_empty() || api_secret.is_empty() {
            anyhow::bail!(
                "BINANCE_API_KEY and BINANCE_API_SECRET must be set (see .env.example)"
            );
        }

        let testnet = std::env::var("BINANCE_TESTNET")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(true);

        let (testnet_api_key, testnet_api_secret, futures_api_key, futures_api_secret) =
            if testnet {
                (
                    std::env::var("BINANCE_TESTNET_API_KEY").unwrap_or_default(),
                    std::env::var("BINANCE_TESTNET_API_SECRET").unwrap_or_default(),
                    std::env::var("BINANCE_TESTNET_FUTURES_API_KEY").unwrap_or_default(),
                    std::env::var("BINANCE_TESTNET_FUTURES_API_SECRET").unwrap_or_default(),
                )
            } else {
                (String::new(), String::new(), String::new(), String::new())
            };

        Ok(Self {
            api_key,
            api_secret,
            testnet,
            testnet_api_key,
            testnet_api_secret,
            futures_api_key,
            futures_api_secret,
        })
    }
}

// =============================================================================
// Default-value helpers (serde `default = "..."` attribute)
// =============================================================================

fn default_spot_pairs() -> Vec<String> {
    vec!["BTC/USDT".into(), "ETH/USDT".into(), "PAXG/USDT".into()]
}

fn default_futures_pairs() -> Vec<String> {
    vec![
        "BTC/USDT".into(),
        "ETH/USDT".into(),
        "LINK/USDT".into(),
        "AVAX/USDT".into(),
        "BNB/USDT".into(),
        "SOL/USDT".into(),
        "DOGE/USDT".into(),
        "ADA/USDT".into(),
    ]
}

fn default_timeframe() -> String {
    "1h".to_string()
}

fn default_check_interval() -> u64 {
    60
}

fn default_max_position_pct() -> f64 {
    0.02
}

fn default_spot_sl_pct() -> f64 {
    0.03
}

fn default_spot_tp_pct() -> f64 {
    0.06
}

fn default_futures_sl_pct() -> f64 {
    0.02
}

fn default_futures_tp_pct() -> f64 {
    0.04
}

fn default_max_open_positions() -> u32 {
    3
}

fn default_max_daily_loss_pct() -> f64 {
    0.05
}

fn default_min_risk_reward() -> f64 {
    1.5
}

fn default_cooldown_minutes() -> i64 {
    30
}

fn default_leverage() -> u32 {
    3
}

fn default_max_leverage() -> u32 {
    5
}

fn default_margin_type() -> String {
    "cross".to_string()
}

fn default_max_margin_ratio() -> f64 {
    0.80
}

fn default_funding_rate_threshold() -> f64 {
    0.001
}

fn default_min_confidence() -> f64 {
    0.3
}

fn default_atr_period() -> u32 {
    14
}

fn default_atr_sl_multiplier() -> f64 {
    1.5
}

fn default_atr_tp_multiplier() -> f64 {
    3.0
}

fn default_true() -> bool {
    true
}

fn default_llm_cli_path() -> String {
    "claude".to_string()
}

fn default_llm_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_target_ltv() -> f64 {
    0.65
}

fn default_danger_ltv() -> f64 {
    0.75
}

fn default_low_ltv() -> f64 {
    0.40
}

fn default_mtf_candle_limit() -> u32 {
    50
}

fn default_mtf_cache_ttl() -> u64 {
    300
}

fn default_bar_interval_seconds() -> u64 {
    60
}

fn default_tick_size() -> f64 {
    0.01
}

fn default_cvd_lookback() -> usize {
    500
}

fn default_zscore_lookback() -> usize {
    20
}

fn default_divergence_peak_order() -> usize {
    5
}

fn default_sfp_swing_lookback() -> usize {
    5
}

fn default_absorption_lookback() -> usize {
    10
}

fn default_signal_threshold() -> f64 {
    0.35
}

fn default_log_level() -> String {
    "info".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// ATR-driven SL/TP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_atr_period")]
    pub period: u32,
    #[serde(default = "default_atr_sl_multiplier")]
    pub sl_multiplier: f64,
    #[serde(default = "default_atr_tp_multiplier")]
    pub tp_multiplier: f64,
}

impl Default for AtrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: default_atr_period(),
            sl_multiplier: default_atr_sl_multiplier(),
            tp_multiplier: default_atr_tp_multiplier(),
        }
    }
}

impl AtrConfig {
    /// Spot default keeps ATR stops off; fixed percentages apply instead.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Spot trading + risk parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotConfig {
    #[serde(default)]
    pub mode: TradingMode,
    #[serde(default = "default_spot_pairs")]
    pub pairs: Vec<String>,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,
    #[serde(default = "default_spot_sl_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_spot_tp_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "AtrConfig::disabled")]
    pub atr: AtrConfig,
}

impl Default for SpotConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty spot config deserialises")
    }
}

/// USDT-M perpetual futures parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_futures_pairs")]
    pub pairs: Vec<String>,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    #[serde(default = "default_margin_type")]
    pub margin_type: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default)]
    pub mode: TradingMode,
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,
    #[serde(default = "default_futures_sl_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_futures_tp_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_margin_ratio")]
    pub max_margin_ratio: f64,
    #[serde(default = "default_funding_rate_threshold")]
    pub funding_rate_threshold: f64,
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default)]
    pub atr: AtrConfig,
    /// Optional independent futures roster; empty = share the spot roster.
    #[serde(default)]
    pub strategies: Vec<StrategyEntry>,
}

impl Default for FuturesConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty futures config deserialises")
    }
}

/// Per-horizon SL/TP multipliers, fixed percentages, sizing and R:R floors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HorizonParams {
    pub sl_multiplier: f64,
    pub tp_multiplier: f64,
    pub sl_pct: f64,
    pub tp_pct: f64,
    pub size_factor: f64,
    pub min_rr: f64,
}

/// Horizon parameters, kept flat in YAML (short/medium/long prefixes) and
/// collapsed into per-horizon blocks at lookup time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HorizonRiskConfig {
    pub short_sl_multiplier: f64,
    pub short_tp_multiplier: f64,
    pub short_sl_pct: f64,
    pub short_tp_pct: f64,
    pub short_size_factor: f64,
    pub short_min_rr: f64,
    pub medium_sl_multiplier: f64,
    pub medium_tp_multiplier: f64,
    pub medium_sl_pct: f64,
    pub medium_tp_pct: f64,
    pub medium_size_factor: f64,
    pub medium_min_rr: f64,
    pub long_sl_multiplier: f64,
    pub long_tp_multiplier: f64,
    pub long_sl_pct: f64,
    pub long_tp_pct: f64,
    pub long_size_factor: f64,
    pub long_min_rr: f64,
}

impl Default for HorizonRiskConfig {
    fn default() -> Self {
        Self {
            short_sl_multiplier: 1.0,
            short_tp_multiplier: 2.0,
            short_sl_pct: 0.02,
            short_tp_pct: 0.04,
            short_size_factor: 1.2,
            short_min_rr: 1.5,
            medium_sl_multiplier: 1.5,
            medium_tp_multiplier: 3.0,
            medium_sl_pct: 0.03,
            medium_tp_pct: 0.06,
            medium_size_factor: 1.0,
            medium_min_rr: 2.0,
            long_sl_multiplier: 2.5,
            long_tp_multiplier: 5.0,
            long_sl_pct: 0.05,
            long_tp_pct: 0.15,
            long_size_factor: 0.6,
            long_min_rr: 2.5,
        }
    }
}

impl HorizonRiskConfig {
    /// Collapse the flat YAML fields into a per-horizon parameter block.
    pub fn params(&self, horizon: Horizon) -> HorizonParams {
        match horizon {
            Horizon::Short => HorizonParams {
                sl_multiplier: self.short_sl_multiplier,
                tp_multiplier: self.short_tp_multiplier,
                sl_pct: self.short_sl_pct,
                tp_pct: self.short_tp_pct,
                size_factor: self.short_size_factor,
                min_rr: self.short_min_rr,
            },
            Horizon::Medium => HorizonParams {
                sl_multiplier: self.medium_sl_multiplier,
                tp_multiplier: self.medium_tp_multiplier,
                sl_pct: self.medium_sl_pct,
                tp_pct: self.medium_tp_pct,
                size_factor: self.medium_size_factor,
                min_rr: self.medium_min_rr,
            },
            Horizon::Long => HorizonParams {
                sl_multiplier: self.long_sl_multiplier,
                tp_multiplier: self.long_tp_multiplier,
                sl_pct: self.long_sl_pct,
                tp_pct: self.long_tp_pct,
                size_factor: self.long_size_factor,
                min_rr: self.long_min_rr,
            },
        }
    }
}

/// One strategy roster entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEntry {
    pub name: String,
    #[serde(default)]
    pub timeframe: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Order-flow aggregation and detector parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFlowConfig {
    #[serde(default = "default_bar_interval_seconds")]
    pub bar_interval_seconds: u64,
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
    #[serde(default = "default_cvd_lookback")]
    pub cvd_lookback: usize,
    #[serde(default = "default_zscore_lookback")]
    pub zscore_lookback: usize,
    #[serde(default = "default_divergence_peak_order")]
    pub divergence_peak_order: usize,
    #[serde(default = "default_sfp_swing_lookback")]
    pub sfp_swing_lookback: usize,
    #[serde(default = "default_absorption_lookback")]
    pub absorption_lookback: usize,
    #[serde(default = "default_signal_threshold")]
    pub signal_threshold: f64,
}

impl Default for OrderFlowConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty orderflow config deserialises")
    }
}

/// LLM decision gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_llm_cli_path")]
    pub cli_path: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty llm config deserialises")
    }
}

/// Loan LTV guardian settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanGuardConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_target_ltv")]
    pub target_ltv: f64,
    #[serde(default = "default_danger_ltv")]
    pub danger_ltv: f64,
    #[serde(default = "default_low_ltv")]
    pub low_ltv: f64,
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

impl Default for LoanGuardConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty loan_guard config deserialises")
    }
}

/// Multi-timeframe summary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mtf_candle_limit")]
    pub candle_limit: u32,
    #[serde(default = "default_mtf_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

impl Default for MtfConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty mtf config deserialises")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// YAML document shape (everything except exchange credentials).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FileConfig {
    #[serde(default)]
    spot: SpotConfig,
    #[serde(default)]
    futures: FuturesConfig,
    #[serde(default)]
    horizon_risk: HorizonRiskConfig,
    #[serde(default)]
    strategies: Vec<StrategyEntry>,
    #[serde(default)]
    orderflow: OrderFlowConfig,
    #[serde(default)]
    llm: LlmConfig,
    #[serde(default)]
    loan_guard: LoanGuardConfig,
    #[serde(default)]
    mtf: MtfConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub exchange: ExchangeConfig,
    pub spot: SpotConfig,
    pub futures: FuturesConfig,
    pub horizon_risk: HorizonRiskConfig,
    pub strategies: Vec<StrategyEntry>,
    pub orderflow: OrderFlowConfig,
    pub llm: LlmConfig,
    pub loan_guard: LoanGuardConfig,
    pub mtf: MtfConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load `.env`-sourced credentials plus `config.yaml` (or an explicit
    /// path). A missing YAML file is fatal; a missing section is not.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path.unwrap_or_else(|| Path::new("config.yaml"));
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let file: FileConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        let exchange = ExchangeConfig::from_env()?;
        let settings = Self::assemble(exchange, file)?;

        info!(
            path = %path.display(),
            spot_pairs = ?settings.spot.pairs,
            futures_enabled = settings.futures.enabled,
            "settings loaded"
        );
        Ok(settings)
    }

    /// Rebuild settings from the sink's config JSON, keeping the current
    /// exchange credentials. Used by config hot-reload and `config-push`.
    pub fn from_value(value: &serde_json::Value, current: &Settings) -> Result<Self> {
        let file: FileConfig = serde_json::from_value(value.clone())
            .context("failed to parse remote config JSON")?;
        Self::assemble(current.exchange.clone(), file)
    }

    fn assemble(exchange: ExchangeConfig, mut file: FileConfig) -> Result<Self> {
        if timeframe_minutes(&file.spot.timeframe).is_none() {
            anyhow::bail!(
                "unsupported spot timeframe '{}' (valid: {:?})",
                file.spot.timeframe,
                VALID_TIMEFRAMES
            );
        }
        if timeframe_minutes(&file.futures.timeframe).is_none() {
            anyhow::bail!(
                "unsupported futures timeframe '{}' (valid: {:?})",
                file.futures.timeframe,
                VALID_TIMEFRAMES
            );
        }
        // Leverage never exceeds the configured ceiling.
        file.futures.leverage = file.futures.leverage.min(file.futures.max_leverage).max(1);

        if file.strategies.is_empty() {
            file.strategies = vec![StrategyEntry {
                name: "sma_crossover".into(),
                timeframe: file.spot.timeframe.clone(),
                params: BTreeMap::new(),
            }];
        }

        Ok(Self {
            exchange,
            spot: file.spot,
            futures: file.futures,
            horizon_risk: file.horizon_risk,
            strategies: file.strategies,
            orderflow: file.orderflow,
            llm: file.llm,
            loan_guard: file.loan_guard,
            mtf: file.mtf,
            logging: file.logging,
        })
    }

    /// Stable fingerprint of the strategy roster: sorted
    /// (name, timeframe, params-json) tuples. Changing any of them forces a
    /// strategy rebuild on hot-reload.
    pub fn strategy_fingerprint(&self) -> String {
        let mut entries: Vec<String> = self
            .strategies
            .iter()
            .map(|e| {
                format!(
                    "{}|{}|{}",
                    e.name,
                    e.timeframe,
                    serde_json::to_string(&e.params).unwrap_or_default()
                )
            })
            .collect();
        entries.sort();
        entries.join(";")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_exchange() -> ExchangeConfig {
        ExchangeConfig {
            api_key: "k".into(),
            api_secret: "s".into(),
            testnet: true,
            testnet_api_key: String::new(),
            testnet_api_secret: String::new(),
            futures_api_key: String::new(),
            futures_api_secret: String::new(),
        }
    }

    fn assemble(yaml: &str) -> Result<Settings> {
        let file: FileConfig = serde_yaml::from_str(yaml).unwrap();
        Settings::assemble(test_exchange(), file)
    }

    #[test]
    fn empty_yaml_uses_defaults() {
        let s = assemble("{}").unwrap();
        assert_eq!(s.spot.mode, TradingMode::Paper);
        assert_eq!(s.spot.pairs.len(), 3);
        assert_eq!(s.spot.max_open_positions, 3);
        assert!((s.spot.max_daily_loss_pct - 0.05).abs() < f64::EPSILON);
        assert!(!s.spot.atr.enabled);
        assert!(s.futures.atr.enabled);
        assert!(!s.futures.enabled);
        assert_eq!(s.futures.leverage, 3);
        assert_eq!(s.llm.timeout, 60);
        // Default roster is a single SMA crossover on the spot timeframe.
        assert_eq!(s.strategies.len(), 1);
        assert_eq!(s.strategies[0].name, "sma_crossover");
        assert_eq!(s.strategies[0].timeframe, "1h");
    }

    #[test]
    fn leverage_clamped_to_max() {
        let s = assemble("futures:\n  leverage: 20\n  max_leverage: 5\n").unwrap();
        assert_eq!(s.futures.leverage, 5);
    }

    #[test]
    fn invalid_timeframe_rejected() {
        assert!(assemble("spot:\n  timeframe: 7m\n").is_err());
    }

    #[test]
    fn horizon_params_mapping() {
        let s = assemble("{}").unwrap();
        let medium = s.horizon_risk.params(Horizon::Medium);
        assert!((medium.sl_multiplier - 1.5).abs() < f64::EPSILON);
        assert!((medium.min_rr - 2.0).abs() < f64::EPSILON);
        let long = s.horizon_risk.params(Horizon::Long);
        assert!((long.size_factor - 0.6).abs() < f64::EPSILON);
        assert!((long.tp_pct - 0.15).abs() < f64::EPSILON);
    }

    #[test]
    fn fingerprint_changes_with_roster() {
        let a = assemble("strategies:\n  - name: sma_crossover\n    timeframe: 1h\n").unwrap();
        let b = assemble("strategies:\n  - name: sma_crossover\n    timeframe: 4h\n").unwrap();
        let c = assemble("strategies:\n  - name: sma_crossover\n    timeframe: 1h\n").unwrap();
        assert_ne!(a.strategy_fingerprint(), b.strategy_fingerprint());
        assert_eq!(a.strategy_fingerprint(), c.strategy_fingerprint());
    }

    #[test]
    fn fingerprint_order_independent() {
        let a = assemble(
            "strategies:\n  - name: sma_crossover\n    timeframe: 1h\n  - name: rsi_oversold\n    timeframe: 15m\n",
        )
        .unwrap();
        let b = assemble(
            "strategies:\n  - name: rsi_oversold\n    timeframe: 15m\n  - name: sma_crossover\n    timeframe: 1h\n",
        )
        .unwrap();
        assert_eq!(a.strategy_fingerprint(), b.strategy_fingerprint());
    }

    #[test]
    fn remote_config_preserves_credentials() {
        let current = assemble("{}").unwrap();
        let remote = serde_json::json!({
            "spot": {"pairs": ["SOL/USDT"], "max_open_positions": 5},
            "futures": {"enabled": true}
        });
        let next = Settings::from_value(&remote, &current).unwrap();
        assert_eq!(next.exchange.api_key, "k");
        assert_eq!(next.spot.pairs, vec!["SOL/USDT"]);
        assert_eq!(next.spot.max_open_positions, 5);
        assert!(next.futures.enabled);
    }

    #[test]
    fn timeframe_minutes_table() {
        assert_eq!(timeframe_minutes("1m"), Some(1));
        assert_eq!(timeframe_minutes("15m"), Some(15));
        assert_eq!(timeframe_minutes("1h"), Some(60));
        assert_eq!(timeframe_minutes("1M"), Some(43200));
        assert_eq!(timeframe_minutes("9h"), None);
    }
}
