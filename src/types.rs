// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Abstract trading signal emitted by strategies and the decision engine.
///
/// `Short` and `Cover` only carry meaning on the futures side; the spot
/// pipeline never opens a short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
    Short,
    Cover,
}

impl Signal {
    /// Uppercase wire form ("BUY", "SELL", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
            Self::Short => "SHORT",
            Self::Cover => "COVER",
        }
    }

    /// Parse an action string from the LLM; unknown values map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "HOLD" => Some(Self::Hold),
            "SHORT" => Some(Self::Short),
            "COVER" => Some(Self::Cover),
            _ => None,
        }
    }

    /// True for signals that open exposure (BUY long, SHORT).
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Buy | Self::Short)
    }

    /// True for signals that reduce exposure (SELL closes long, COVER closes short).
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Sell | Self::Cover)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether orders are simulated locally, sent to the testnet, or sent against
/// real funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Testnet,
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Testnet => "testnet",
            Self::Live => "live",
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Futures position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }

    /// The signal that closes a position on this side.
    pub fn close_signal(&self) -> Signal {
        match self {
            Self::Long => Signal::Sell,
            Self::Short => Signal::Cover,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holding-time class selected by the LLM; drives SL/TP multipliers and
/// position size factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Short,
    Medium,
    Long,
}

impl Default for Horizon {
    fn default() -> Self {
        Self::Medium
    }
}

impl Horizon {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
        }
    }

    /// Parse a horizon string; anything unrecognized falls back to `Medium`.
    pub fn parse_or_medium(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "short" => Self::Short,
            "long" => Self::Long,
            _ => Self::Medium,
        }
    }

    /// Minimum holding time before a spot long may be closed manually.
    pub fn min_hold_minutes(&self) -> i64 {
        match self {
            Self::Short => 60,
            Self::Medium => 240,
            Self::Long => 480,
        }
    }
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_roundtrip() {
        for s in [Signal::Buy, Signal::Sell, Signal::Hold, Signal::Short, Signal::Cover] {
            assert_eq!(Signal::parse(s.as_str()), Some(s));
        }
        assert_eq!(Signal::parse("buy"), Some(Signal::Buy));
        assert_eq!(Signal::parse("bogus"), None);
    }

    #[test]
    fn signal_open_close_classes() {
        assert!(Signal::Buy.is_open());
        assert!(Signal::Short.is_open());
        assert!(Signal::Sell.is_close());
        assert!(Signal::Cover.is_close());
        assert!(!Signal::Hold.is_open());
        assert!(!Signal::Hold.is_close());
    }

    #[test]
    fn horizon_fallback_and_min_hold() {
        assert_eq!(Horizon::parse_or_medium("short"), Horizon::Short);
        assert_eq!(Horizon::parse_or_medium("whatever"), Horizon::Medium);
        assert_eq!(Horizon::Short.min_hold_minutes(), 60);
        assert_eq!(Horizon::Medium.min_hold_minutes(), 240);
        assert_eq!(Horizon::Long.min_hold_minutes(), 480);
    }

    #[test]
    fn side_close_signal() {
        assert_eq!(PositionSide::Long.close_signal(), Signal::Sell);
        assert_eq!(PositionSide::Short.close_signal(), Signal::Cover);
    }
}
