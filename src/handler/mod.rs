// =============================================================================
// Per-symbol handlers — the spot and futures cycle pipelines
// =============================================================================

pub mod futures;
pub mod spot;

use chrono::{DateTime, Timelike, Utc};

use crate::config::timeframe_minutes;
use crate::strategy::Strategy;

/// Scheduling slot: minutes since UTC midnight divided by the finest
/// timeframe. OHLCV strategies run at most once per slot per symbol.
pub(crate) fn current_slot(finest_tf_minutes: u32, now: DateTime<Utc>) -> i64 {
    let minutes_since_midnight = (now.hour() * 60 + now.minute()) as i64;
    minutes_since_midnight / finest_tf_minutes.max(1) as i64
}

/// The finest timeframe (in minutes) across the OHLCV strategies; defaults
/// to 15 when none declare one.
pub(crate) fn finest_timeframe_minutes(strategies: &[Strategy]) -> u32 {
    strategies
        .iter()
        .filter_map(|s| match s {
            Strategy::Ohlcv(s) => timeframe_minutes(s.timeframe()),
            Strategy::OrderFlow(_) => None,
        })
        .min()
        .unwrap_or(15)
}

/// Format a holding duration like "3h10m" / "45m".
pub(crate) fn format_hold_duration(minutes: i64) -> String {
    if minutes >= 60 {
        format!("{}h{}m", minutes / 60, minutes % 60)
    } else {
        format!("{minutes}m")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn slot_math() {
        // 10:30 UTC = 630 minutes.
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 0).unwrap();
        assert_eq!(current_slot(15, t), 42);
        assert_eq!(current_slot(60, t), 10);
        // 10:44 is still slot 42 on 15m; 10:45 advances.
        let t2 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 44, 59).unwrap();
        assert_eq!(current_slot(15, t2), 42);
        let t3 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 45, 0).unwrap();
        assert_eq!(current_slot(15, t3), 43);
    }

    #[test]
    fn hold_duration_formatting() {
        assert_eq!(format_hold_duration(45), "45m");
        assert_eq!(format_hold_duration(190), "3h10m");
        assert_eq!(format_hold_duration(60), "1h0m");
    }
}
