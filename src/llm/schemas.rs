// =============================================================================
// LLM decision engine data models
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{Horizon, Signal};

/// One open position, summarised for the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub unrealized_pnl_pct: f64,
    #[serde(default)]
    pub holding_duration: String,
    /// "long" / "short"; spot positions are always long.
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub liquidation_price: Option<f64>,
    /// Horizon chosen at entry, if known.
    #[serde(default)]
    pub entry_horizon: String,
    /// The LLM's own entry reasoning, echoed back for exit decisions.
    #[serde(default)]
    pub entry_reasoning: String,
}

/// Portfolio snapshot rebuilt per decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioState {
    pub available_balance: f64,
    pub positions: Vec<PositionInfo>,
    pub max_positions: u32,
    pub current_position_count: u32,
    pub daily_realized_pnl: f64,
    /// available × max_daily_loss_pct + daily_realized_pnl.
    pub daily_risk_remaining: f64,
    // Futures-only fields; zero for spot.
    #[serde(default)]
    pub margin_balance: f64,
    #[serde(default)]
    pub margin_ratio: f64,
    #[serde(default)]
    pub leverage: u32,
}

/// Raw decision parsed from the LLM's JSON reply. Optional numeric fields
/// may come back as null; `normalize` coerces them to safe defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmDecision {
    pub action: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub position_size_pct: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub horizon: Option<String>,
}

impl LlmDecision {
    pub fn hold(reasoning: impl Into<String>) -> Self {
        Self {
            action: "HOLD".into(),
            confidence: 0.0,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            position_size_pct: None,
            reasoning: Some(reasoning.into()),
            horizon: None,
        }
    }

    pub fn stop_loss_or_zero(&self) -> f64 {
        self.stop_loss.unwrap_or(0.0)
    }

    pub fn take_profit_or_zero(&self) -> f64 {
        self.take_profit.unwrap_or(0.0)
    }

    /// Suggested position fraction; defaults to 2%.
    pub fn position_size_pct_or_default(&self) -> f64 {
        self.position_size_pct.unwrap_or(0.02)
    }

    pub fn reasoning_str(&self) -> &str {
        self.reasoning.as_deref().unwrap_or("")
    }

    pub fn horizon_parsed(&self) -> Horizon {
        Horizon::parse_or_medium(self.horizon.as_deref().unwrap_or("medium"))
    }
}

/// Final, enforced decision handed to the handlers.
#[derive(Debug, Clone)]
pub struct DecisionResult {
    pub signal: Signal,
    pub confidence: f64,
    pub horizon: Horizon,
    /// True when the LLM out-voted the strategies with confidence >= 0.7;
    /// downstream halves the position size.
    pub llm_override: bool,
    /// The LLM's suggested position fraction (0 = no suggestion).
    pub llm_size_pct: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub reasoning: String,
}

impl DecisionResult {
    pub fn hold() -> Self {
        Self {
            signal: Signal::Hold,
            confidence: 0.0,
            horizon: Horizon::Medium,
            llm_override: false,
            llm_size_pct: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            reasoning: String::new(),
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
    fn decision_null_fields_coerce() {
        let json = r#"{"action": "BUY", "confidence": 0.8, "stop_loss": null,
                        "take_profit": null, "position_size_pct": null,
                        "reasoning": null, "horizon": null}"#;
        let d: LlmDecision = serde_json::from_str(json).unwrap();
        assert!((d.stop_loss_or_zero()).abs() < f64::EPSILON);
        assert!((d.position_size_pct_or_default() - 0.02).abs() < f64::EPSILON);
        assert_eq!(d.reasoning_str(), "");
        assert_eq!(d.horizon_parsed(), Horizon::Medium);
    }

    #[test]
    fn decision_missing_fields_default() {
        let d: LlmDecision = serde_json::from_str(r#"{"action": "SELL"}"#).unwrap();
        assert_eq!(d.action, "SELL");
        assert!((d.confidence).abs() < f64::EPSILON);
    }

    #[test]
    fn horizon_parsing() {
        let d: LlmDecision =
            serde_json::from_str(r#"{"action": "BUY", "horizon": "long"}"#).unwrap();
        assert_eq!(d.horizon_parsed(), Horizon::Long);
        let d: LlmDecision =
            serde_json::from_str(r#"{"action": "BUY", "horizon": "sideways"}"#).unwrap();
        assert_eq!(d.horizon_parsed(), Horizon::Medium);
    }
}
