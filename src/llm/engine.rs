// =============================================================================
// LLM Decision Engine — the mandatory gate between verdicts and orders
// =============================================================================
//
// Flow: summarize verdicts + portfolio + risk metrics + MTF → prompt → CLI
// call → tolerant JSON parse → validation → support check. Every failure mode
// (timeout, bad exit, unparseable reply, invalid action) collapses to HOLD;
// no trade happens without an affirmative, parseable decision.
//
// Support rule: a non-HOLD action with no backing strategy verdict needs
// confidence >= 0.7 and is flagged `llm_override` (downstream halves the
// size); below that it becomes HOLD. Close actions are exempt — they reduce
// risk.
// =============================================================================

use tracing::{info, warn};

use crate::config::LlmConfig;
use crate::indicators::TimeframeSummary;
use crate::llm::client::LlmClient;
use crate::llm::schemas::{DecisionResult, LlmDecision, PortfolioState};
use crate::llm::summarizer::{
    build_decision_prompt, extract_json_object, summarize_multi_timeframe, summarize_portfolio,
    summarize_risk_metrics, summarize_verdicts,
};
use crate::risk::metrics::RiskMetrics;
use crate::strategy::router::Router;
use crate::strategy::StrategyVerdict;
use crate::types::Signal;

pub struct LlmDecisionEngine {
    pub enabled: bool,
    model: String,
    client: Option<LlmClient>,
}

impl LlmDecisionEngine {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            enabled: config.enabled,
            model: config.model.clone(),
            client: config.enabled.then(|| LlmClient::new(config)),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask the LLM for a raw decision. Infrastructure failures surface as the
    /// HOLD decision rather than an error.
    #[allow(clippy::too_many_arguments)]
    pub async fn decide(
        &self,
        verdicts: &[StrategyVerdict],
        portfolio: &PortfolioState,
        symbol: &str,
        current_price: f64,
        market_type: &str,
        risk_metrics: Option<&RiskMetrics>,
        mtf_summaries: &[TimeframeSummary],
    ) -> LlmDecision {
        let Some(client) = &self.client else {
            info!("LLM disabled — weighted-vote fallback");
            return Self::fallback_decision(verdicts);
        };

        let strategy_summary = summarize_verdicts(verdicts);
        let portfolio_summary = summarize_portfolio(portfolio);
        let risk_summary = risk_metrics
            .map(|m| summarize_risk_metrics(m, symbol, current_price))
            .unwrap_or_default();
        let mtf_summary = summarize_multi_timeframe(mtf_summaries);

        let prompt = build_decision_prompt(
            &strategy_summary,
            &portfolio_summary,
            symbol,
            current_price,
            market_type,
            &risk_summary,
            &mtf_summary,
        );

        let response = match client.decide_text(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(symbol, error = %e, "LLM call failed — HOLD");
                return LlmDecision::hold(format!("LLM call failed: {e}"));
            }
        };

        let decision = Self::parse_decision(&response);
        info!(
            action = %decision.action,
            confidence = decision.confidence,
            reasoning = %truncate(decision.reasoning_str(), 100),
            "LLM decision"
        );
        decision
    }

    /// Parse and validate the raw reply. Anything malformed becomes HOLD.
    fn parse_decision(response: &str) -> LlmDecision {
        let Some(value) = extract_json_object(response) else {
            warn!("no JSON object in LLM reply — HOLD");
            return LlmDecision::hold("unparseable LLM reply");
        };

        let mut decision: LlmDecision = match serde_json::from_value(value) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "LLM JSON did not match the decision shape — HOLD");
                return LlmDecision::hold(format!("decision parse failed: {e}"));
            }
        };

        if Signal::parse(&decision.action).is_none() {
            warn!(action = %decision.action, "invalid action from LLM — coerced to HOLD");
            decision.action = "HOLD".into();
            decision.confidence = 0.0;
        }
        decision.confidence = decision.confidence.clamp(0.0, 1.0);
        decision
    }

    /// Weighted-vote fallback used when the gate is disabled.
    fn fallback_decision(verdicts: &[StrategyVerdict]) -> LlmDecision {
        let mut router = Router::new();
        for v in verdicts {
            router.collect(v.clone());
        }
        let vote = router.weighted_vote();
        LlmDecision {
            action: vote.signal.as_str().to_string(),
            confidence: vote.confidence,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            position_size_pct: None,
            reasoning: Some(vote.reasoning),
            horizon: None,
        }
    }

    /// Full decision pipeline: LLM call + the strategy-support rule. This is
    /// the only path by which a non-HOLD signal reaches the handlers.
    #[allow(clippy::too_many_arguments)]
    pub async fn make_decision(
        &self,
        verdicts: &[StrategyVerdict],
        portfolio: &PortfolioState,
        symbol: &str,
        current_price: f64,
        market_type: &str,
        risk_metrics: Option<&RiskMetrics>,
        mtf_summaries: &[TimeframeSummary],
    ) -> DecisionResult {
        let non_hold: Vec<&StrategyVerdict> =
            verdicts.iter().filter(|v| v.signal != Signal::Hold).collect();
        if non_hold.is_empty() {
            return DecisionResult::hold();
        }

        // Non-HOLD actions never bypass the gate: a disabled LLM means HOLD.
        if !self.enabled {
            return DecisionResult::hold();
        }

        let decision = self
            .decide(
                verdicts,
                portfolio,
                symbol,
                current_price,
                market_type,
                risk_metrics,
                mtf_summaries,
            )
            .await;

        let llm_signal = Signal::parse(&decision.action).unwrap_or(Signal::Hold);
        if llm_signal == Signal::Hold {
            return DecisionResult::hold();
        }

        let support =
            Self::check_support(llm_signal, verdicts, market_type).resolve(decision.confidence);
        let llm_override = match support {
            SupportCheck::Supported => false,
            SupportCheck::Override => {
                warn!(
                    symbol,
                    action = %llm_signal,
                    confidence = decision.confidence,
                    "LLM overrides strategies — half size"
                );
                true
            }
            SupportCheck::Unsupported | SupportCheck::NeedsConfidence => {
                warn!(
                    symbol,
                    action = %llm_signal,
                    confidence = decision.confidence,
                    "LLM action lacks strategy support and confidence < 0.7 — HOLD"
                );
                return DecisionResult::hold();
            }
        };

        DecisionResult {
            signal: llm_signal,
            confidence: decision.confidence,
            horizon: decision.horizon_parsed(),
            llm_override,
            llm_size_pct: decision.position_size_pct_or_default(),
            stop_loss: decision.stop_loss_or_zero(),
            take_profit: decision.take_profit_or_zero(),
            reasoning: decision.reasoning_str().to_string(),
        }
    }

    fn check_support(
        llm_signal: Signal,
        verdicts: &[StrategyVerdict],
        market_type: &str,
    ) -> SupportCheck {
        // Closing reduces risk and needs no strategy backing.
        if llm_signal.is_close() {
            return SupportCheck::Supported;
        }

        let supported = verdicts.iter().any(|v| {
            v.signal == llm_signal
                // Futures: a SELL verdict backs a SHORT entry.
                || (market_type == "futures"
                    && llm_signal == Signal::Short
                    && v.signal == Signal::Sell)
        });
        if supported {
            return SupportCheck::Supported;
        }
        SupportCheck::NeedsConfidence
    }
}

enum SupportCheck {
    Supported,
    Override,
    Unsupported,
    NeedsConfidence,
}

impl SupportCheck {
    fn resolve(self, confidence: f64) -> SupportCheck {
        match self {
            SupportCheck::NeedsConfidence if confidence >= 0.7 => SupportCheck::Override,
            SupportCheck::NeedsConfidence => SupportCheck::Unsupported,
            other => other,
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn verdict(signal: Signal, confidence: f64) -> StrategyVerdict {
        StrategyVerdict {
            strategy_name: "test".into(),
            signal,
            confidence,
            reasoning: String::new(),
            timeframe: "1h".into(),
            key_evidence: Vec::new(),
            indicators: BTreeMap::new(),
        }
    }

    #[test]
    fn parse_valid_decision() {
        let d = LlmDecisionEngine::parse_decision(
            r#"```json
{"action": "BUY", "confidence": 0.7, "horizon": "medium",
 "stop_loss": 48500, "take_profit": 53000, "position_size_pct": 0.02}
```"#,
        );
        assert_eq!(d.action, "BUY");
        assert!((d.confidence - 0.7).abs() < f64::EPSILON);
        assert!((d.stop_loss_or_zero() - 48_500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_invalid_action_coerced() {
        let d = LlmDecisionEngine::parse_decision(r#"{"action": "MOON", "confidence": 0.9}"#);
        assert_eq!(d.action, "HOLD");
        assert!((d.confidence).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_garbage_holds() {
        let d = LlmDecisionEngine::parse_decision("I refuse to answer in JSON today");
        assert_eq!(d.action, "HOLD");
    }

    #[test]
    fn parse_confidence_clamped() {
        let d = LlmDecisionEngine::parse_decision(r#"{"action": "BUY", "confidence": 1.7}"#);
        assert!((d.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn support_check_backed_action() {
        let verdicts = vec![verdict(Signal::Buy, 0.6)];
        let check = LlmDecisionEngine::check_support(Signal::Buy, &verdicts, "spot").resolve(0.5);
        assert!(matches!(check, SupportCheck::Supported));
    }

    #[test]
    fn support_check_unbacked_low_confidence_holds() {
        let verdicts = vec![verdict(Signal::Buy, 0.6)];
        let check =
            LlmDecisionEngine::check_support(Signal::Short, &verdicts, "futures").resolve(0.5);
        assert!(matches!(check, SupportCheck::Unsupported));
    }

    #[test]
    fn support_check_unbacked_high_confidence_overrides() {
        let verdicts = vec![verdict(Signal::Hold, 0.0)];
        let check = LlmDecisionEngine::check_support(Signal::Buy, &verdicts, "spot").resolve(0.75);
        assert!(matches!(check, SupportCheck::Override));
    }

    #[test]
    fn support_check_close_exempt() {
        let verdicts = vec![verdict(Signal::Buy, 0.6)];
        let check = LlmDecisionEngine::check_support(Signal::Sell, &verdicts, "spot").resolve(0.1);
        assert!(matches!(check, SupportCheck::Supported));
        let check =
            LlmDecisionEngine::check_support(Signal::Cover, &verdicts, "futures").resolve(0.1);
        assert!(matches!(check, SupportCheck::Supported));
    }

    #[test]
    fn support_check_sell_backs_short_on_futures() {
        let verdicts = vec![verdict(Signal::Sell, 0.6)];
        let check =
            LlmDecisionEngine::check_support(Signal::Short, &verdicts, "futures").resolve(0.4);
        assert!(matches!(check, SupportCheck::Supported));
        // Not on spot.
        let check = LlmDecisionEngine::check_support(Signal::Short, &verdicts, "spot").resolve(0.4);
        assert!(matches!(check, SupportCheck::Unsupported));
    }

    #[tokio::test]
    async fn all_hold_short_circuits() {
        let engine = LlmDecisionEngine::new(&crate::config::LlmConfig::default());
        let verdicts = vec![verdict(Signal::Hold, 0.0)];
        let result = engine
            .make_decision(
                &verdicts,
                &PortfolioState::default(),
                "BTC/USDT",
                100.0,
                "spot",
                None,
                &[],
            )
            .await;
        assert_eq!(result.signal, Signal::Hold);
    }

    #[tokio::test]
    async fn disabled_llm_holds_non_hold_verdicts() {
        let config: crate::config::LlmConfig = serde_yaml::from_str("enabled: false").unwrap();
        let engine = LlmDecisionEngine::new(&config);
        let verdicts = vec![verdict(Signal::Buy, 0.9)];
        let result = engine
            .make_decision(
                &verdicts,
                &PortfolioState::default(),
                "BTC/USDT",
                100.0,
                "spot",
                None,
                &[],
            )
            .await;
        // The gate never lets an un-reviewed non-HOLD through.
        assert_eq!(result.signal, Signal::Hold);
    }
}
