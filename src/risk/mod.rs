// =============================================================================
// Risk layer — advisory metrics plus the spot and futures risk managers
// =============================================================================

pub mod futures;
pub mod metrics;
pub mod spot;

use crate::config::HorizonParams;
use crate::data::models::Candle;
use crate::indicators::compute_atr;

/// How the final SL/TP pair was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlTpMethod {
    LlmValidated,
    Atr,
    FixedPct,
}

/// Resolved protective prices plus their distances from entry.
#[derive(Debug, Clone)]
pub struct ResolvedSlTp {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub sl_distance: f64,
    pub tp_distance: f64,
    pub method: SlTpMethod,
    pub note: String,
}

/// Validate LLM-proposed SL/TP prices for one side.
///
/// Checks: direction, SL distance within [0.5%, 15%] of price, and the
/// per-horizon R:R floor (TP is extended when R:R falls short). Returns
/// `Err(reason)` when the prices cannot be used at all.
fn validate_llm_prices(
    price: f64,
    llm_sl: f64,
    llm_tp: f64,
    hp: &HorizonParams,
    is_short: bool,
) -> Result<(f64, f64, String), String> {
    let (sl_dist, tp_dist) = if is_short {
        if llm_sl <= price || llm_tp >= price {
            return Err("short SL/TP on wrong side of price".into());
        }
        (llm_sl - price, price - llm_tp)
    } else {
        if llm_sl >= price || llm_tp <= price {
            return Err("long SL/TP on wrong side of price".into());
        }
        (price - llm_sl, llm_tp - price)
    };

    let sl_pct = sl_dist / price;
    if sl_pct < 0.005 {
        return Err(format!("SL too close ({:.2}% < 0.5%)", sl_pct * 100.0));
    }
    if sl_pct > 0.15 {
        return Err(format!("SL too far ({:.2}% > 15%)", sl_pct * 100.0));
    }

    let rr = if sl_dist > 0.0 { tp_dist / sl_dist } else { 0.0 };
    let mut tp = llm_tp;
    let mut note = String::new();
    if rr < hp.min_rr {
        let adjusted_tp_dist = sl_dist * hp.min_rr;
        tp = if is_short {
            price - adjusted_tp_dist
        } else {
            price + adjusted_tp_dist
        };
        note = format!("TP extended to R:R>={:.1} ({:.2}->{:.1})", hp.min_rr, rr, hp.min_rr);
    }

    Ok((llm_sl, tp, note))
}

/// SL/TP resolution pipeline: LLM prices (validated) → ATR → fixed
/// percentages, all scaled by the horizon parameters.
#[allow(clippy::too_many_arguments)]
pub fn resolve_sl_tp(
    is_short: bool,
    price: f64,
    hp: &HorizonParams,
    llm_sl: f64,
    llm_tp: f64,
    ohlcv: Option<&[Candle]>,
    atr_enabled: bool,
    atr_period: usize,
) -> ResolvedSlTp {
    // 1. LLM-proposed prices, when both are present.
    if llm_sl > 0.0 && llm_tp > 0.0 {
        match validate_llm_prices(price, llm_sl, llm_tp, hp, is_short) {
            Ok((sl, tp, note)) => {
                let (sl_distance, tp_distance) = if is_short {
                    (sl - price, price - tp)
                } else {
                    (price - sl, tp - price)
                };
                return ResolvedSlTp {
                    stop_loss: sl,
                    take_profit: tp,
                    sl_distance,
                    tp_distance,
                    method: SlTpMethod::LlmValidated,
                    note,
                };
            }
            Err(reason) => {
                // Fall through to ATR with the rejection recorded.
                let mut resolved =
                    resolve_from_market(is_short, price, hp, ohlcv, atr_enabled, atr_period);
                resolved.note = format!("LLM prices rejected ({reason})");
                return resolved;
            }
        }
    }

    resolve_from_market(is_short, price, hp, ohlcv, atr_enabled, atr_period)
}

fn resolve_from_market(
    is_short: bool,
    price: f64,
    hp: &HorizonParams,
    ohlcv: Option<&[Candle]>,
    atr_enabled: bool,
    atr_period: usize,
) -> ResolvedSlTp {
    let atr = if atr_enabled {
        ohlcv.map(|c| compute_atr(c, atr_period)).unwrap_or(0.0)
    } else {
        0.0
    };

    let (sl_distance, tp_distance, method) = if atr > 0.0 {
        (atr * hp.sl_multiplier, atr * hp.tp_multiplier, SlTpMethod::Atr)
    } else {
        (price * hp.sl_pct, price * hp.tp_pct, SlTpMethod::FixedPct)
    };

    let (stop_loss, take_profit) = if is_short {
        (price + sl_distance, price - tp_distance)
    } else {
        (price - sl_distance, price + tp_distance)
    };

    ResolvedSlTp {
        stop_loss,
        take_profit,
        sl_distance,
        tp_distance,
        method,
        note: String::new(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn hp() -> HorizonParams {
        HorizonParams {
            sl_multiplier: 1.5,
            tp_multiplier: 3.0,
            sl_pct: 0.03,
            tp_pct: 0.06,
            size_factor: 1.0,
            min_rr: 2.0,
        }
    }

    fn candles(n: usize, price: f64, range: f64) -> Vec<Candle> {
        (0..n)
            .map(|_| Candle {
                open_time: 0,
                open: price,
                high: price + range,
                low: price - range,
                close: price,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn llm_prices_accepted_for_long() {
        let r = resolve_sl_tp(false, 50_000.0, &hp(), 48_500.0, 53_000.0, None, true, 14);
        assert_eq!(r.method, SlTpMethod::LlmValidated);
        assert!((r.stop_loss - 48_500.0).abs() < 1e-9);
        assert!((r.take_profit - 53_000.0).abs() < 1e-9);
        // rr = 3000/1500 = 2.0 — no extension needed.
        assert!(r.note.is_empty());
    }

    #[test]
    fn llm_tp_extended_when_rr_short() {
        // sl dist 1000, tp dist 1000 → rr 1.0 < 2.0: TP moves to 52000.
        let r = resolve_sl_tp(false, 50_000.0, &hp(), 49_000.0, 51_000.0, None, true, 14);
        assert_eq!(r.method, SlTpMethod::LlmValidated);
        assert!((r.take_profit - 52_000.0).abs() < 1e-9);
        assert!(r.note.contains("TP extended"));
    }

    #[test]
    fn llm_wrong_direction_falls_back() {
        // SL above price for a long is invalid.
        let r = resolve_sl_tp(false, 100.0, &hp(), 105.0, 110.0, None, false, 14);
        assert_eq!(r.method, SlTpMethod::FixedPct);
        assert!(r.note.contains("rejected"));
        assert!((r.stop_loss - 97.0).abs() < 1e-9);
        assert!((r.take_profit - 106.0).abs() < 1e-9);
    }

    #[test]
    fn llm_sl_too_close_falls_back() {
        // 0.2% SL distance < 0.5% floor.
        let r = resolve_sl_tp(false, 100.0, &hp(), 99.8, 106.0, None, false, 14);
        assert!(r.note.contains("rejected"));
        assert_eq!(r.method, SlTpMethod::FixedPct);
    }

    #[test]
    fn llm_sl_too_far_falls_back() {
        let r = resolve_sl_tp(false, 100.0, &hp(), 80.0, 140.0, None, false, 14);
        assert!(r.note.contains("rejected"));
    }

    #[test]
    fn atr_path_used_when_available() {
        let c = candles(30, 100.0, 1.0); // ATR = 2.0
        let r = resolve_sl_tp(false, 100.0, &hp(), 0.0, 0.0, Some(&c), true, 14);
        assert_eq!(r.method, SlTpMethod::Atr);
        assert!((r.sl_distance - 3.0).abs() < 1e-9); // 2.0 × 1.5
        assert!((r.tp_distance - 6.0).abs() < 1e-9); // 2.0 × 3.0
        assert!((r.stop_loss - 97.0).abs() < 1e-9);
    }

    #[test]
    fn fixed_pct_when_atr_disabled() {
        let c = candles(30, 100.0, 1.0);
        let r = resolve_sl_tp(false, 100.0, &hp(), 0.0, 0.0, Some(&c), false, 14);
        assert_eq!(r.method, SlTpMethod::FixedPct);
        assert!((r.sl_distance - 3.0).abs() < 1e-9); // 100 × 0.03
    }

    #[test]
    fn short_side_prices_mirror() {
        let r = resolve_sl_tp(true, 100.0, &hp(), 0.0, 0.0, None, false, 14);
        assert!(r.stop_loss > 100.0);
        assert!(r.take_profit < 100.0);
        assert!((r.stop_loss - 103.0).abs() < 1e-9);
        assert!((r.take_profit - 94.0).abs() < 1e-9);
    }

    #[test]
    fn short_llm_validation() {
        let r = resolve_sl_tp(true, 100.0, &hp(), 103.0, 94.0, None, false, 14);
        assert_eq!(r.method, SlTpMethod::LlmValidated);
        assert!((r.sl_distance - 3.0).abs() < 1e-9);
        assert!((r.tp_distance - 6.0).abs() < 1e-9);
    }
}
