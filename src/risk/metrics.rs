// =============================================================================
// Advisory risk metrics — computed before the LLM call
// =============================================================================
//
// These numbers inform the LLM; nothing here is binding. `evaluate()` on the
// risk managers re-checks everything before an order is allowed out.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;

/// Pre-computed risk picture for one prospective entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskMetrics {
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub sl_distance: f64,
    pub tp_distance: f64,
    pub risk_reward_ratio: f64,
    pub atr_value: f64,
    pub atr_used: bool,
    /// 1 for spot.
    pub leverage: u32,
    /// 0 for spot.
    pub liquidation_price: f64,
    /// Fraction of the account lost if the stop is hit at full size.
    pub account_risk_pct: f64,
    pub passes_min_rr: bool,
    /// Non-empty when a trivially-checkable gate already fails (cap reached,
    /// already holding, ...). Advisory only.
    pub reason: String,
    /// Fibonacci retracement levels keyed by ratio.
    pub fib_levels: BTreeMap<String, f64>,
    pub support_levels: Vec<f64>,
    pub resistance_levels: Vec<f64>,
    pub bb_upper: f64,
    pub bb_mid: f64,
    pub bb_lower: f64,
    pub bb_pct_b: f64,
}
