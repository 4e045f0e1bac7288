// =============================================================================
// Prompt assembly — verdicts / portfolio / risk metrics / MTF → Markdown
// =============================================================================

use crate::indicators::TimeframeSummary;
use crate::llm::schemas::PortfolioState;
use crate::risk::metrics::RiskMetrics;
use crate::strategy::StrategyVerdict;

const SYSTEM_PROMPT: &str = r#"You are a senior crypto trading decision-maker. Your task is to weigh the analytical verdicts of several strategies against current market data and produce one final trading decision.

## Decision principles

1. Assess each strategy's evidence quality and logic individually.
2. When strategies disagree, judge which evidence base is more reliable.
3. Risk comes first: missing a trade is always acceptable, unnecessary risk is not.
4. Adjust for the current portfolio state.

## Hard risk lines

- Do not open new positions when capital usage is already above 80%.
- When today's realized loss approaches the daily limit, lean HOLD.
- Never add to a pair already held.
- Confidence below 0.3 always means HOLD.

## Reply format

Finish your reply with a JSON block:

```json
{
  "action": "BUY",
  "confidence": 0.75,
  "horizon": "medium",
  "entry_price": 50000,
  "stop_loss": 48500,
  "take_profit": 53000,
  "position_size_pct": 0.02,
  "reasoning": "strategy A's CVD divergence is strong and confirmed by an SFP..."
}
```

`action` must be one of "BUY", "SELL", "SHORT", "COVER", "HOLD".
`horizon` must be one of "short", "medium", "long"."#;

/// Per-strategy sections of the prompt.
pub fn summarize_verdicts(verdicts: &[StrategyVerdict]) -> String {
    if verdicts.is_empty() {
        return "## Strategy verdicts\nNo strategy analysis available.\n".to_string();
    }

    let mut sections = vec!["## Strategy verdicts\n".to_string()];
    for (i, v) in verdicts.iter().enumerate() {
        let mut section = format!(
            "### Strategy {}: {}\n- **Signal**: {} (confidence {:.2})\n- **Reasoning**: {}\n",
            i + 1,
            v.strategy_name,
            v.signal,
            v.confidence,
            v.reasoning
        );
        if !v.key_evidence.is_empty() {
            section.push_str("- **Key evidence**:\n");
            for ev in &v.key_evidence {
                section.push_str(&format!("  - {ev}\n"));
            }
        }
        if !v.indicators.is_empty() {
            let parts: Vec<String> = v
                .indicators
                .iter()
                .take(8)
                .map(|(k, val)| format!("{k}={val:.4}"))
                .collect();
            section.push_str(&format!("- **Indicators**: {}\n", parts.join(", ")));
        }
        sections.push(section);
    }
    sections.join("\n")
}

/// Portfolio section: balances, caps, risk budget and the position table.
pub fn summarize_portfolio(state: &PortfolioState) -> String {
    let mut lines = vec![
        "## Current portfolio\n".to_string(),
        format!("- Available balance: {:.2} USDT", state.available_balance),
        format!(
            "- Open positions: {}/{}",
            state.current_position_count, state.max_positions
        ),
        format!("- Daily realized PnL: {:+.2} USDT", state.daily_realized_pnl),
        format!("- Daily risk budget left: {:.2} USDT", state.daily_risk_remaining),
    ];
    if state.margin_balance > 0.0 {
        lines.push(format!("- Margin balance: {:.2} USDT", state.margin_balance));
        lines.push(format!("- Margin ratio: {:.1}%", state.margin_ratio * 100.0));
        lines.push(format!("- Leverage: {}x", state.leverage));
    }

    if state.positions.is_empty() {
        lines.push("\nNo open positions.".to_string());
    } else {
        lines.push("\n| Pair | Qty | Entry | Now | Unrealized | Held | Entry context |".to_string());
        lines.push("|------|-----|-------|-----|------------|------|---------------|".to_string());
        for p in &state.positions {
            let label = if p.side == "short" || (p.leverage > 1 && !p.side.is_empty()) {
                format!("{} ({})", p.symbol, p.side)
            } else {
                p.symbol.clone()
            };
            let context = if p.entry_horizon.is_empty() {
                String::new()
            } else {
                format!("{}: {}", p.entry_horizon, truncate(&p.entry_reasoning, 60))
            };
            lines.push(format!(
                "| {} | {:.4} | {:.2} | {:.2} | {:+.2} ({:+.1}%) | {} | {} |",
                label,
                p.quantity,
                p.entry_price,
                p.current_price,
                p.unrealized_pnl,
                p.unrealized_pnl_pct * 100.0,
                p.holding_duration,
                context
            ));
        }
    }
    lines.join("\n")
}

/// Pre-computed risk metrics section.
pub fn summarize_risk_metrics(metrics: &RiskMetrics, symbol: &str, price: f64) -> String {
    let mut lines = vec![
        "## Pre-computed risk metrics\n".to_string(),
        format!("- Pair: {symbol} @ {price:.2}"),
        format!(
            "- Suggested SL {:.2} / TP {:.2} (R:R {:.2}, floor {})",
            metrics.stop_loss_price,
            metrics.take_profit_price,
            metrics.risk_reward_ratio,
            if metrics.passes_min_rr { "met" } else { "NOT met" }
        ),
    ];
    if metrics.atr_used {
        lines.push(format!("- ATR: {:.4}", metrics.atr_value));
    }
    if metrics.leverage > 1 {
        lines.push(format!(
            "- Leverage {}x, estimated liquidation {:.2}",
            metrics.leverage, metrics.liquidation_price
        ));
        lines.push(format!(
            "- Account risk if stopped: {:.2}%",
            metrics.account_risk_pct * 100.0
        ));
    }
    if !metrics.support_levels.is_empty() || !metrics.resistance_levels.is_empty() {
        lines.push(format!(
            "- Support: {} | Resistance: {}",
            format_levels(&metrics.support_levels),
            format_levels(&metrics.resistance_levels)
        ));
    }
    if !metrics.fib_levels.is_empty() {
        let fib: Vec<String> = metrics
            .fib_levels
            .iter()
            .filter(|(k, _)| !k.starts_with("swing"))
            .map(|(k, v)| format!("{k}={v:.2}"))
            .collect();
        lines.push(format!("- Fibonacci: {}", fib.join(", ")));
    }
    if metrics.bb_mid > 0.0 {
        lines.push(format!(
            "- Bollinger: upper {:.2} / mid {:.2} / lower {:.2} (%B {:.2})",
            metrics.bb_upper, metrics.bb_mid, metrics.bb_lower, metrics.bb_pct_b
        ));
    }
    if !metrics.reason.is_empty() {
        lines.push(format!("- NOTE: a risk gate already fails: {}", metrics.reason));
    }
    lines.join("\n")
}

/// Multi-timeframe section from the summaries already computed per fetch.
pub fn summarize_multi_timeframe(summaries: &[TimeframeSummary]) -> String {
    if summaries.is_empty() {
        return String::new();
    }
    let mut lines = vec!["## Multi-timeframe picture\n".to_string()];
    for s in summaries {
        let rsi = s
            .rsi_14
            .map(|v| format!("{v:.0}"))
            .unwrap_or_else(|| "-".into());
        let sma = s
            .sma_20
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "-".into());
        let bb = s
            .bb_pct_b
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "-".into());
        lines.push(format!(
            "- {}: trend {} ({:+.2}% over 10 bars), close {:.2}, SMA20 {}, RSI {}, %B {}",
            s.timeframe, s.trend, s.change_pct, s.close, sma, rsi, bb
        ));
    }
    lines.join("\n")
}

/// Assemble the full decision prompt.
#[allow(clippy::too_many_arguments)]
pub fn build_decision_prompt(
    strategy_summaries: &str,
    portfolio_state: &str,
    symbol: &str,
    current_price: f64,
    market_type: &str,
    risk_metrics_summary: &str,
    mtf_summary: &str,
) -> String {
    let mut prompt = format!(
        "{SYSTEM_PROMPT}\n\n---\n\n# Pair: {symbol} ({market_type})\n# Price: {current_price:.2} USDT\n\n{portfolio_state}\n\n{strategy_summaries}\n"
    );
    if !risk_metrics_summary.is_empty() {
        prompt.push_str(&format!("\n{risk_metrics_summary}\n"));
    }
    if !mtf_summary.is_empty() {
        prompt.push_str(&format!("\n{mtf_summary}\n"));
    }
    prompt.push_str(
        "\n---\n\nAnalyse the verdicts step by step, judge whether they support or \
         contradict each other, weigh the portfolio state, then give your final \
         decision. Remember to end with the JSON decision block.\n",
    );
    prompt
}

/// Tolerant JSON extraction: strip markdown fences, then take the first
/// balanced `{...}` object.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let cleaned = text.replace("```json", "```");

    // Prefer fenced blocks when present.
    let candidates: Vec<&str> = if cleaned.contains("```") {
        cleaned.split("```").skip(1).step_by(2).collect()
    } else {
        vec![cleaned.as_str()]
    };

    for candidate in candidates.into_iter().chain(std::iter::once(cleaned.as_str())) {
        if let Some(obj) = first_balanced_object(candidate) {
            if let Ok(value) = serde_json::from_str(&obj) {
                return Some(value);
            }
        }
    }
    None
}

fn first_balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

fn format_levels(levels: &[f64]) -> String {
    if levels.is_empty() {
        return "-".to_string();
    }
    levels
        .iter()
        .map(|l| format!("{l:.2}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signal;

    fn verdict(name: &str, signal: Signal, conf: f64) -> StrategyVerdict {
        StrategyVerdict {
            strategy_name: name.into(),
            signal,
            confidence: conf,
            reasoning: "test reasoning".into(),
            timeframe: "1h".into(),
            key_evidence: vec!["evidence A".into()],
            indicators: [("rsi".to_string(), 35.5)].into_iter().collect(),
        }
    }

    #[test]
    fn verdict_summary_lists_strategies() {
        let text = summarize_verdicts(&[
            verdict("sma_crossover", Signal::Buy, 0.6),
            verdict("rsi_oversold", Signal::Hold, 0.0),
        ]);
        assert!(text.contains("Strategy 1: sma_crossover"));
        assert!(text.contains("BUY (confidence 0.60)"));
        assert!(text.contains("evidence A"));
        assert!(text.contains("rsi=35.5000"));
    }

    #[test]
    fn portfolio_summary_with_positions() {
        let state = PortfolioState {
            available_balance: 1234.5,
            positions: vec![crate::llm::schemas::PositionInfo {
                symbol: "BTC/USDT".into(),
                quantity: 0.001,
                entry_price: 50_000.0,
                current_price: 51_000.0,
                unrealized_pnl: 1.0,
                unrealized_pnl_pct: 0.02,
                holding_duration: "3h10m".into(),
                entry_horizon: "medium".into(),
                entry_reasoning: "CVD divergence".into(),
                ..Default::default()
            }],
            max_positions: 3,
            current_position_count: 1,
            daily_realized_pnl: -5.0,
            daily_risk_remaining: 45.0,
            ..Default::default()
        };
        let text = summarize_portfolio(&state);
        assert!(text.contains("1234.50 USDT"));
        assert!(text.contains("1/3"));
        assert!(text.contains("BTC/USDT"));
        assert!(text.contains("3h10m"));
        assert!(text.contains("medium: CVD divergence"));
    }

    #[test]
    fn json_extraction_from_fenced_block() {
        let text = "Some analysis here.\n```json\n{\"action\": \"BUY\", \"confidence\": 0.7}\n```\nDone.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["action"], "BUY");
    }

    #[test]
    fn json_extraction_from_bare_text() {
        let text = "thinking... {\"action\": \"HOLD\", \"confidence\": 0.0} trailing";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["action"], "HOLD");
    }

    #[test]
    fn json_extraction_nested_and_strings() {
        let text = r#"{"action": "SELL", "reasoning": "price {dropped}", "meta": {"x": 1}}"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["action"], "SELL");
        assert_eq!(value["meta"]["x"], 1);
    }

    #[test]
    fn json_extraction_garbage_is_none() {
        assert!(extract_json_object("no json here at all").is_none());
        assert!(extract_json_object("{broken json").is_none());
    }

    #[test]
    fn prompt_contains_all_sections() {
        let prompt = build_decision_prompt(
            "STRAT",
            "PORT",
            "BTC/USDT",
            50_000.0,
            "futures",
            "RISK",
            "MTF",
        );
        assert!(prompt.contains("BTC/USDT (futures)"));
        assert!(prompt.contains("STRAT"));
        assert!(prompt.contains("PORT"));
        assert!(prompt.contains("RISK"));
        assert!(prompt.contains("MTF"));
        assert!(prompt.contains("JSON decision block"));
    }
}
