// =============================================================================
// Strategy Router — per-invocation verdict accumulator
// =============================================================================
//
// A fresh Router is created for every (symbol, cycle) invocation so verdicts
// never leak across symbols. The weighted vote is the fallback path used only
// when the LLM gate is disabled.
// =============================================================================

use std::collections::HashMap;

use crate::strategy::StrategyVerdict;
use crate::types::Signal;

#[derive(Default)]
pub struct Router {
    fallback_weights: HashMap<String, f64>,
    verdicts: Vec<StrategyVerdict>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weights(fallback_weights: HashMap<String, f64>) -> Self {
        Self {
            fallback_weights,
            verdicts: Vec::new(),
        }
    }

    pub fn collect(&mut self, verdict: StrategyVerdict) {
        self.verdicts.push(verdict);
    }

    pub fn get_verdicts(&self) -> Vec<StrategyVerdict> {
        self.verdicts.clone()
    }

    /// Weighted-vote fallback: average weighted confidence per direction and
    /// take the stronger side when it clears 0.3, else HOLD.
    pub fn weighted_vote(&self) -> StrategyVerdict {
        if self.verdicts.is_empty() {
            return StrategyVerdict::hold("router_weighted_vote", "", "no verdicts available");
        }

        let mut buy_score = 0.0;
        let mut sell_score = 0.0;
        let mut total_weight = 0.0;
        let mut evidence = Vec::new();

        for v in &self.verdicts {
            let weight = self
                .fallback_weights
                .get(&v.strategy_name)
                .copied()
                .unwrap_or(1.0);
            total_weight += weight;
            match v.signal {
                Signal::Buy => {
                    buy_score += v.confidence * weight;
                    evidence.push(format!(
                        "{}: BUY ({:.2}) x {:.1}",
                        v.strategy_name, v.confidence, weight
                    ));
                }
                Signal::Sell => {
                    sell_score += v.confidence * weight;
                    evidence.push(format!(
                        "{}: SELL ({:.2}) x {:.1}",
                        v.strategy_name, v.confidence, weight
                    ));
                }
                _ => evidence.push(format!("{}: HOLD ({:.2})", v.strategy_name, v.confidence)),
            }
        }

        if total_weight > 0.0 {
            buy_score /= total_weight;
            sell_score /= total_weight;
        }

        let (signal, confidence) = if buy_score > sell_score && buy_score > 0.3 {
            (Signal::Buy, buy_score)
        } else if sell_score > buy_score && sell_score > 0.3 {
            (Signal::Sell, sell_score)
        } else {
            (Signal::Hold, 0.0)
        };

        StrategyVerdict {
            strategy_name: "router_weighted_vote".into(),
            signal,
            confidence,
            reasoning: format!("weighted vote: buy={buy_score:.3}, sell={sell_score:.3}"),
            timeframe: String::new(),
            key_evidence: evidence,
            indicators: Default::default(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(name: &str, signal: Signal, confidence: f64) -> StrategyVerdict {
        StrategyVerdict {
            strategy_name: name.into(),
            signal,
            confidence,
            reasoning: String::new(),
            timeframe: "1h".into(),
            key_evidence: Vec::new(),
            indicators: Default::default(),
        }
    }

    #[test]
    fn collect_and_get() {
        let mut router = Router::new();
        router.collect(verdict("a", Signal::Buy, 0.5));
        router.collect(verdict("b", Signal::Hold, 0.0));
        assert_eq!(router.get_verdicts().len(), 2);
    }

    #[test]
    fn vote_buy_majority() {
        let mut router = Router::new();
        router.collect(verdict("a", Signal::Buy, 0.8));
        router.collect(verdict("b", Signal::Buy, 0.6));
        router.collect(verdict("c", Signal::Sell, 0.2));
        let result = router.weighted_vote();
        assert_eq!(result.signal, Signal::Buy);
        // (0.8 + 0.6) / 3 ≈ 0.467
        assert!((result.confidence - 1.4 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn vote_below_threshold_holds() {
        let mut router = Router::new();
        router.collect(verdict("a", Signal::Buy, 0.4));
        router.collect(verdict("b", Signal::Hold, 0.0));
        router.collect(verdict("c", Signal::Hold, 0.0));
        // 0.4 / 3 ≈ 0.13 < 0.3 → HOLD
        let result = router.weighted_vote();
        assert_eq!(result.signal, Signal::Hold);
        assert!((result.confidence).abs() < f64::EPSILON);
    }

    #[test]
    fn vote_respects_weights() {
        let mut weights = HashMap::new();
        weights.insert("heavy".to_string(), 3.0);
        let mut router = Router::with_weights(weights);
        router.collect(verdict("heavy", Signal::Sell, 0.8));
        router.collect(verdict("light", Signal::Buy, 0.9));
        let result = router.weighted_vote();
        // sell = 0.8*3/4 = 0.6, buy = 0.9/4 = 0.225
        assert_eq!(result.signal, Signal::Sell);
        assert!((result.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn vote_empty_holds() {
        let router = Router::new();
        let result = router.weighted_vote();
        assert_eq!(result.signal, Signal::Hold);
    }
}
