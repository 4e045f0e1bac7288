// =============================================================================
// Loan guardian — flexible-loan LTV monitor and collateral rebalancer
// =============================================================================
//
// Five LTV bands per ongoing loan:
//   >= danger_ltv        → protect: buy collateral and pledge toward target_ltv
//   >= danger_ltv - 5%   → warn (approaching danger)
//   <= low_ltv           → take profit: redeem collateral toward target_ltv
//   <= low_ltv + 5%      → notice (approaching low threshold)
//   otherwise            → safe
//
// Any mutating action is first sent to the LLM for an approve/reject review;
// a failed or unparseable review means no action. `dry_run` logs the intended
// operation without touching the exchange.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::LoanGuardConfig;
use crate::exchange::spot::SpotClient;
use crate::llm::client::LlmClient;
use crate::llm::summarizer::extract_json_object;
use crate::sink::Sink;

pub struct LoanGuardian {
    exchange: Arc<SpotClient>,
    sink: Arc<Sink>,
    llm_client: LlmClient,
    pub config: LoanGuardConfig,
    /// Last seen LTV per collateral/loan pair — unchanged values are skipped.
    last_ltv: HashMap<String, f64>,
}

impl LoanGuardian {
    pub fn new(
        exchange: Arc<SpotClient>,
        sink: Arc<Sink>,
        llm_client: LlmClient,
        config: LoanGuardConfig,
    ) -> Self {
        Self {
            exchange,
            sink,
            llm_client,
            config,
            last_ltv: HashMap::new(),
        }
    }

    /// Inspect every ongoing loan and act per the LTV bands.
    pub async fn check(&mut self) -> Result<()> {
        let orders = self.exchange.fetch_loan_ongoing_orders(20).await?;
        if orders.is_empty() {
            return Ok(());
        }

        for order in orders {
            let loan_coin = order["loanCoin"].as_str().unwrap_or("?").to_string();
            let collateral_coin = order["collateralCoin"].as_str().unwrap_or("?").to_string();
            let ltv = parse_f64(&order["currentLTV"]);
            let debt = parse_f64(&order["totalDebt"]);
            let collateral_amount = parse_f64(&order["collateralAmount"]);
            let label = format!("{collateral_coin}->{loan_coin}");
            let pair_key = format!("{collateral_coin}/{loan_coin}");

            let ltv_rounded = (ltv * 10_000.0).round() / 10_000.0;
            if self.last_ltv.get(&pair_key) == Some(&ltv_rounded) {
                continue;
            }
            self.last_ltv.insert(pair_key, ltv_rounded);

            self.sink
                .insert_loan_health(json!({
                    "loan_coin": loan_coin,
                    "collateral_coin": collateral_coin,
                    "ltv": ltv,
                    "total_debt": debt,
                    "collateral_amount": collateral_amount,
                    "action_taken": "none",
                }))
                .await;

            let lg = &self.config;
            let warn_high = lg.danger_ltv - 0.05;
            let warn_low = lg.low_ltv + 0.05;

            if ltv >= lg.danger_ltv {
                warn!(
                    loan = %label,
                    ltv_pct = ltv * 100.0,
                    danger_pct = lg.danger_ltv * 100.0,
                    "LTV above danger threshold — protecting"
                );
                self.loan_protect(&order, &loan_coin, &collateral_coin, ltv, debt, collateral_amount)
                    .await;
            } else if ltv >= warn_high {
                warn!(loan = %label, ltv_pct = ltv * 100.0, "LTV approaching danger threshold");
            } else if ltv <= lg.low_ltv {
                info!(
                    loan = %label,
                    ltv_pct = ltv * 100.0,
                    low_pct = lg.low_ltv * 100.0,
                    "LTV below low threshold — taking profit"
                );
                self.loan_take_profit(&loan_coin, &collateral_coin, ltv, debt).await;
            } else if ltv <= warn_low {
                info!(loan = %label, ltv_pct = ltv * 100.0, "LTV approaching low threshold");
            } else {
                info!(loan = %label, ltv_pct = ltv * 100.0, "LTV safe");
            }
        }
        Ok(())
    }

    /// Danger path: size the collateral top-up that returns LTV to target,
    /// have the LLM review it, then buy and pledge.
    async fn loan_protect(
        &self,
        _order: &serde_json::Value,
        loan_coin: &str,
        collateral_coin: &str,
        ltv: f64,
        debt: f64,
        collateral_amount: f64,
    ) {
        let lg = &self.config;
        let collateral_value = if ltv > 0.0 { debt / ltv } else { 0.0 };
        let target_collateral_value = debt / lg.target_ltv;
        let additional_value_usdt = target_collateral_value - collateral_value;
        if additional_value_usdt <= 0.0 {
            return;
        }

        let pair = format!("{collateral_coin}/USDT");
        let coin_price = match self.exchange.get_ticker(&pair).await {
            Ok(t) => t.last,
            Err(e) => {
                error!(pair = %pair, error = %e, "ticker unavailable — protect aborted");
                return;
            }
        };
        if coin_price <= 0.0 {
            return;
        }
        let additional_qty = additional_value_usdt / coin_price;
        let buy_cost_usdt = additional_qty * coin_price;

        let usdt_available = match self.exchange.get_balance().await {
            Ok(b) => b.get("USDT").copied().unwrap_or(0.0) + b.get("LDUSDT").copied().unwrap_or(0.0),
            Err(_) => 0.0,
        };

        let review = format!(
            "# Loan protection — review request\n\n\
             ## Current state\n\
             - Debt: {debt:.2} {loan_coin}\n\
             - Collateral: {collateral_amount:.8} {collateral_coin} (~{collateral_value:.2} USDT)\n\
             - Current LTV: {:.1}% (danger threshold {:.0}%)\n\
             - {collateral_coin} price: {coin_price:.4} USDT\n\n\
             ## Proposed action\n\
             1. Market-buy {additional_qty:.8} {collateral_coin} (~{buy_cost_usdt:.2} USDT)\n\
             2. Pledge it as additional collateral\n\
             3. Expected LTV after: ~{:.0}%\n\n\
             ## Account\n\
             - Available USDT: {usdt_available:.2}\n\
             - Required: {buy_cost_usdt:.2} USDT ({})\n\n\
             Reply with JSON only: {{\"approved\": true/false, \"reason\": \"...\"}}.\n\
             Reject if the balance is insufficient, the price looks abnormal, or the risk is too high.\n",
            ltv * 100.0,
            lg.danger_ltv * 100.0,
            lg.target_ltv * 100.0,
            if usdt_available >= buy_cost_usdt { "sufficient" } else { "INSUFFICIENT" },
        );

        info!(
            collateral_coin,
            additional_qty, buy_cost_usdt, "collateral top-up sized — sending for review"
        );
        if !self.review_approved(&review).await {
            return;
        }

        if lg.dry_run {
            info!(
                collateral_coin,
                additional_qty, "[dry-run] would buy and pledge collateral"
            );
            return;
        }

        // Use what is already in the wallet before buying more.
        let existing = match self.exchange.get_balance().await {
            Ok(b) => b.get(collateral_coin).copied().unwrap_or(0.0),
            Err(_) => 0.0,
        };
        let need_to_buy = additional_qty - existing;
        if need_to_buy > 0.0 {
            match self.exchange.place_market_order(&pair, "buy", need_to_buy).await {
                Ok(order) => info!(
                    collateral_coin,
                    filled = order["filled"].as_f64().unwrap_or(0.0),
                    price = order["price"].as_f64().unwrap_or(coin_price),
                    "collateral bought"
                ),
                Err(e) => {
                    error!(collateral_coin, error = %e, "collateral buy failed");
                    if existing <= 0.0 {
                        return;
                    }
                }
            }
        }

        let actual_available = match self.exchange.get_balance().await {
            Ok(b) => b.get(collateral_coin).copied().unwrap_or(0.0),
            Err(_) => existing,
        };
        let pledge_qty = additional_qty.min(actual_available);

        match self
            .exchange
            .loan_adjust_ltv(loan_coin, collateral_coin, pledge_qty, true)
            .await
        {
            Ok(_) => {
                info!(collateral_coin, pledge_qty, "collateral pledged — LTV should fall");
                self.sink
                    .insert_loan_health(json!({
                        "loan_coin": loan_coin,
                        "collateral_coin": collateral_coin,
                        "ltv": ltv,
                        "total_debt": debt,
                        "collateral_amount": collateral_amount,
                        "action_taken": "protect",
                    }))
                    .await;
            }
            Err(e) => {
                error!(
                    collateral_coin,
                    error = %e,
                    "pledge failed — bought collateral stays in the spot wallet"
                );
            }
        }
    }

    /// Low-LTV path: redeem excess collateral back toward target and sell it.
    async fn loan_take_profit(&self, loan_coin: &str, collateral_coin: &str, ltv: f64, debt: f64) {
        let lg = &self.config;
        let collateral_value = if ltv > 0.0 { debt / ltv } else { 0.0 };
        let target_collateral_value = debt / lg.target_ltv;
        let excess_value_usdt = collateral_value - target_collateral_value;
        if excess_value_usdt <= 0.0 {
            return;
        }

        let pair = format!("{collateral_coin}/USDT");
        let coin_price = match self.exchange.get_ticker(&pair).await {
            Ok(t) => t.last,
            Err(e) => {
                error!(pair = %pair, error = %e, "ticker unavailable — take-profit aborted");
                return;
            }
        };
        if coin_price <= 0.0 {
            return;
        }
        let redeem_qty = excess_value_usdt / coin_price;

        let review = format!(
            "# Loan take-profit — review request\n\n\
             - Debt: {debt:.2} {loan_coin}\n\
             - Current LTV: {:.1}% (low threshold {:.0}%)\n\
             - Proposal: redeem {redeem_qty:.8} {collateral_coin} of collateral \
             (~{excess_value_usdt:.2} USDT) and sell it, returning LTV to ~{:.0}%.\n\n\
             Reply with JSON only: {{\"approved\": true/false, \"reason\": \"...\"}}.\n",
            ltv * 100.0,
            lg.low_ltv * 100.0,
            lg.target_ltv * 100.0,
        );
        if !self.review_approved(&review).await {
            return;
        }

        if lg.dry_run {
            info!(collateral_coin, redeem_qty, "[dry-run] would redeem and sell collateral");
            return;
        }

        match self
            .exchange
            .loan_adjust_ltv(loan_coin, collateral_coin, redeem_qty, false)
            .await
        {
            Ok(_) => info!(collateral_coin, redeem_qty, "collateral redeemed"),
            Err(e) => {
                error!(collateral_coin, error = %e, "collateral redemption failed");
                return;
            }
        }

        match self.exchange.place_market_order(&pair, "sell", redeem_qty).await {
            Ok(order) => {
                info!(
                    collateral_coin,
                    filled = order["filled"].as_f64().unwrap_or(0.0),
                    "redeemed collateral sold"
                );
                self.sink
                    .insert_loan_health(json!({
                        "loan_coin": loan_coin,
                        "collateral_coin": collateral_coin,
                        "ltv": ltv,
                        "total_debt": debt,
                        "action_taken": "take_profit",
                    }))
                    .await;
            }
            Err(e) => error!(collateral_coin, error = %e, "collateral sell failed"),
        }
    }

    /// Ask the LLM to approve a proposed action. Any failure or unparseable
    /// reply counts as a rejection.
    async fn review_approved(&self, review: &str) -> bool {
        let response = match self.llm_client.decide_text(review).await {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "LLM review failed — action not taken");
                return false;
            }
        };
        let Some(parsed) = extract_json_object(&response) else {
            warn!(reply = %response.chars().take(100).collect::<String>(), "non-JSON review reply — treated as rejection");
            return false;
        };
        let approved = parsed["approved"].as_bool().unwrap_or(false);
        let reason = parsed["reason"].as_str().unwrap_or("no reason given");
        if approved {
            info!(reason, "LLM approved loan action");
        } else {
            info!(reason, "LLM rejected loan action");
        }
        approved
    }
}

/// Loan endpoints report numbers as strings.
fn parse_f64(value: &serde_json::Value) -> f64 {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(0.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_f64_string_or_number() {
        assert!((parse_f64(&json!("0.72")) - 0.72).abs() < 1e-12);
        assert!((parse_f64(&json!(0.5)) - 0.5).abs() < 1e-12);
        assert!((parse_f64(&json!(null))).abs() < f64::EPSILON);
    }
}
